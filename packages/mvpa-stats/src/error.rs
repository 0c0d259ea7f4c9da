use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unknown correction method '{got}' (valid: {valid})")]
    UnknownCorrectionMethod { got: String, valid: String },

    #[error("Unknown tail '{got}' (valid: {valid})")]
    UnknownTail { got: String, valid: String },

    #[error("Unknown dimension reduction '{got}' (valid: {valid})")]
    UnknownReduceDims { got: String, valid: String },

    #[error("Unknown metric '{got}' (valid: {valid})")]
    UnknownMetric { got: String, valid: String },

    #[error("No stats results to average")]
    EmptyInput,

    #[error("At least 2 subjects are required for a test, got {0}")]
    InsufficientSubjects(usize),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StatsError>;
