use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state store lock poisoned")]
    Poisoned,

    #[error("source '{0}' was already ingested")]
    AlreadyIngested(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<StateError> for parkflow_core::Error {
    fn from(e: StateError) -> Self {
        parkflow_core::Error::StateStore(e.to_string())
    }
}

pub type StateResult<T> = Result<T, StateError>;
