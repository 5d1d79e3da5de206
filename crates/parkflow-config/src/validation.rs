use crate::error::{ConfigError, ConfigResult};
use crate::pipeline::PipelineConfig;

/// Validate a pipeline configuration.
///
/// The feed is checked separately by [`PipelineConfig::feed_source`], since
/// only `run` needs one; a config that sets both is still rejected here.
pub fn validate_config(config: &PipelineConfig) -> ConfigResult<()> {
    if config.poll_interval_seconds == 0 {
        return Err(ConfigError::InvalidPollInterval);
    }
    if config.retry.max_attempts == 0 {
        return Err(ConfigError::InvalidMaxAttempts);
    }
    if config.sink_endpoints.is_empty() {
        return Err(ConfigError::NoSinks);
    }
    config.sinks()?;

    if !is_plain_identifier(&config.postgres.table) {
        return Err(ConfigError::InvalidTableName(config.postgres.table.clone()));
    }
    if config.feed.url.is_some() && config.feed.directory.is_some() {
        return Err(ConfigError::ConflictingFeed);
    }
    Ok(())
}

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_plain_identifier(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
