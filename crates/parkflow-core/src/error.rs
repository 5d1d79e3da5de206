use thiserror::Error;

/// Errors that can occur in parkflow-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("invalid delivery transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
