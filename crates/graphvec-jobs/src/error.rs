//! Job error types.

use graphvec_core::{Classify, ErrorKind, GraphvecError};
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job and broker level errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// The delivery payload is not a valid job.
    #[error("Malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A broker operation failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The broker connection or channel is gone.
    #[error("Broker connection lost: {0}")]
    Disconnected(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Store, generation or resilience failure.
    #[error(transparent)]
    Core(#[from] GraphvecError),
}

impl JobError {
    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }
}

impl Classify for JobError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::InvalidInput,
            Self::Broker(_) | Self::Disconnected(_) => ErrorKind::Connection,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Core(e) => e.kind(),
        }
    }
}

impl From<lapin::Error> for JobError {
    fn from(err: lapin::Error) -> Self {
        JobError::Broker(err.to_string())
    }
}
