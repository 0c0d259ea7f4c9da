pub mod averager;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fdr;
pub mod permutation;
pub mod profiling;
pub mod pstruct;
pub mod types;

pub use averager::{average_and_test, StatsAverager};
pub use config::{CorrectionMethod, ReduceDims, StatsConfig, Tail};
pub use error::{Result, StatsError};
pub use fdr::{FdrCorrector, FdrOutcome};
pub use permutation::{ClusterPermutationTester, ClusterTestOutcome, TestedCluster};
pub use pstruct::PStructBuilder;
pub use stat_test::{OneSampleTTest, StatTest, TestOutcome};
pub use types::*;
