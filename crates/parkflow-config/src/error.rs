use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("poll_interval_seconds must be greater than zero")]
    InvalidPollInterval,

    #[error("retry.max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("at least one sink endpoint is required")]
    NoSinks,

    #[error("invalid sink endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("duplicate sink name '{0}'")]
    DuplicateSinkName(String),

    #[error("invalid table name '{0}': expected an identifier like parking_data or schema.table")]
    InvalidTableName(String),

    #[error("no feed configured: set feed.url or feed.directory")]
    MissingFeed,

    #[error("feed.url and feed.directory are mutually exclusive")]
    ConflictingFeed,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
