use parkflow_sink::SinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid table name '{0}'")]
    InvalidTable(String),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;

/// SQLSTATE classes that no amount of retrying will fix: data exceptions,
/// integrity violations, syntax/undefined objects, unsupported features.
pub(crate) fn is_permanent_sqlstate(code: &str) -> bool {
    ["22", "23", "42", "0A"]
        .iter()
        .any(|class| code.starts_with(class))
}

pub(crate) fn to_sink_error(e: tokio_postgres::Error) -> SinkError {
    match e.as_db_error() {
        Some(db_err) if is_permanent_sqlstate(db_err.code().code()) => SinkError::Rejected(format!(
            "{} (code: {})",
            db_err.message(),
            db_err.code().code()
        )),
        Some(db_err) => SinkError::Connection(db_err.message().to_string()),
        None => SinkError::Connection(e.to_string()),
    }
}

impl From<PgError> for SinkError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::InvalidTable(_) => SinkError::Rejected(e.to_string()),
            other => SinkError::Connection(other.to_string()),
        }
    }
}
