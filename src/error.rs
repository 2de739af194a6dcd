use std::time::Duration;
use thiserror::Error;

/// Fatal errors for a whole diagnosis run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid assessment window: {0}")]
    Configuration(String),
    #[error("failed to collect measurements for assessment")]
    Fetch(#[source] sqlx::Error),
    #[error("failed to register diagnoses")]
    Persistence(#[source] sqlx::Error),
    #[error("diagnosis registration aborted: {0}")]
    Fault(String),
}

/// Per-measurement assessment failures. These are logged and excluded from
/// the batch; they never abort the run.
#[derive(Debug, Error)]
pub enum AssessmentError {
    #[error("no algorithm found for '{name}:{version}'")]
    UnknownAlgorithm { name: String, version: String },
    #[error("failed to write assessment input: {0}")]
    Input(#[from] csv::Error),
    #[error("assessment I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("assessment command failed: {0}")]
    Command(String),
    #[error("unusable assessment output: {0}")]
    Output(String),
    #[error("algorithm lookup failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error("assessment timed out after {0:?}")]
    Timeout(Duration),
}
