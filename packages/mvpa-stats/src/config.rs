//! Typed configuration for group statistics.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration: uncorrected two-sided testing at p < 0.05.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StatsError};

pub const DEFAULT_INDIV_PVAL: f64 = 0.05;
pub const DEFAULT_CLUSTER_PVAL: f64 = 0.05;
pub const DEFAULT_PERMUTATIONS: usize = 1000;

/// Multiple-comparisons correction applied after the per-sample test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CorrectionMethod {
    #[default]
    Uncorrected,
    Fdr,
    ClusterBased,
    /// Skip testing entirely
    None,
}

impl CorrectionMethod {
    pub const ALL: &'static [CorrectionMethod] = &[
        Self::Uncorrected,
        Self::Fdr,
        Self::ClusterBased,
        Self::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncorrected => "uncorrected",
            Self::Fdr => "fdr",
            Self::ClusterBased => "cluster_based",
            Self::None => "none",
        }
    }
}

/// Direction of the per-sample hypothesis test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tail {
    #[default]
    Both,
    Left,
    Right,
}

impl Tail {
    pub const ALL: &'static [Tail] = &[Self::Both, Self::Left, Self::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Both => "both",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Collapse a time×time generalization matrix to a single time axis before testing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReduceDims {
    #[default]
    None,
    /// Train time == test time
    Diag,
    /// Average over training time, keeping the test axis
    AvTrain,
    /// Average over testing time, keeping the train axis
    AvTest,
}

impl ReduceDims {
    pub const ALL: &'static [ReduceDims] = &[Self::None, Self::Diag, Self::AvTrain, Self::AvTest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Diag => "diag",
            Self::AvTrain => "avtrain",
            Self::AvTest => "avtest",
        }
    }
}

fn valid_list<T: Copy>(all: &[T], name: fn(&T) -> &'static str) -> String {
    all.iter().map(name).collect::<Vec<_>>().join(", ")
}

impl FromStr for CorrectionMethod {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StatsError::UnknownCorrectionMethod {
                got: s.to_string(),
                valid: valid_list(Self::ALL, Self::as_str),
            })
    }
}

impl FromStr for Tail {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StatsError::UnknownTail {
                got: s.to_string(),
                valid: valid_list(Self::ALL, Self::as_str),
            })
    }
}

impl FromStr for ReduceDims {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StatsError::UnknownReduceDims {
                got: s.to_string(),
                valid: valid_list(Self::ALL, Self::as_str),
            })
    }
}

macro_rules! string_backed {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = StatsError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

string_backed!(CorrectionMethod, Tail, ReduceDims);

/// Complete group statistics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub mpcompcor_method: CorrectionMethod,
    /// Per-sample alpha
    pub indiv_pval: f64,
    /// Cluster-level alpha; doubles as the FDR target rate
    pub cluster_pval: f64,
    pub tail: Tail,
    /// Samples eligible for testing, shaped like the (reduced) result
    pub mask: Option<ArrayD<bool>>,
    pub n_permutations: usize,
    /// Base seed for the permutation RNGs; drawn at random when absent
    pub seed: Option<u64>,
    pub reduce_dims: ReduceDims,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            mpcompcor_method: CorrectionMethod::default(),
            indiv_pval: DEFAULT_INDIV_PVAL,
            cluster_pval: DEFAULT_CLUSTER_PVAL,
            tail: Tail::default(),
            mask: None,
            n_permutations: DEFAULT_PERMUTATIONS,
            seed: None,
            reduce_dims: ReduceDims::default(),
        }
    }
}

impl StatsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded stats config from {}", path.as_ref().display());
        Self::from_json(&content)
    }

    pub fn with_method(mut self, method: CorrectionMethod) -> Self {
        self.mpcompcor_method = method;
        self
    }

    pub fn with_tail(mut self, tail: Tail) -> Self {
        self.tail = tail;
        self
    }

    pub fn with_mask(mut self, mask: ArrayD<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_permutations(mut self, n_permutations: usize) -> Self {
        self.n_permutations = n_permutations;
        self
    }

    /// Check thresholds and permutation count
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("indiv_pval", self.indiv_pval),
            ("cluster_pval", self.cluster_pval),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(StatsError::InvalidParameter(format!(
                    "{} must lie in (0, 1), got {}",
                    name, value
                )));
            }
        }
        if self.mpcompcor_method == CorrectionMethod::ClusterBased && self.n_permutations == 0 {
            return Err(StatsError::InvalidParameter(
                "n_permutations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
