use std::time::Duration;

use thiserror::Error;

/// Errors from sink commits.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rejected by sink: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    /// Check if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkError::Io(_) | SinkError::Connection(_) | SinkError::Timeout(_)
        )
    }

    /// Check if this error is permanent.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

pub type SinkResult<T> = Result<T, SinkError>;
