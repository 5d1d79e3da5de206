use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parkflow_core::{ChangePolicy, RetryPolicy};
use serde::Deserialize;

use crate::endpoint::{name_sinks, SinkEndpoint, SinkSpec};
use crate::env::resolve_env;
use crate::error::{ConfigError, ConfigResult};

/// Starter configuration written by `parkflow init`.
pub const TEMPLATE: &str = r#"# parkflow configuration

poll_interval_seconds = 60
checkpoint_path = "parkflow.db"

# "console", postgres://... / postgresql://..., or file://<path>.
# Use { name = "...", endpoint = "..." } to pick a sink name.
sink_endpoints = [
    "console",
    # "${DATABASE_URL}",
    # { name = "archive", endpoint = "file://./changes.jsonl" },
]

# "available_spaces" or "available_spaces_or_closed"
change_policy = "available_spaces"

[feed]
url = "https://download.data.grandlyon.com/files/rdata/lpa_mobilite.donnees/parking_temps_reel.json"
# directory = "./parking_data"
# delete_after_ingest = false

[retry]
max_attempts = 5
base_delay_ms = 500
max_delay_ms = 30000

[postgres]
table = "parking_data"
"#;

/// Pipeline configuration as parsed from parkflow.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between snapshot polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Path of the SQLite state/checkpoint database.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    #[serde(default)]
    pub sink_endpoints: Vec<SinkEndpointConfig>,
    #[serde(default)]
    pub change_policy: ChangePolicy,
    /// How long an observation sink may take to accept a batch.
    #[serde(default = "default_observer_timeout")]
    pub observer_timeout_ms: u64,
    /// How long in-flight commits may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

/// A sink endpoint, either bare or with an explicit name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SinkEndpointConfig {
    Endpoint(String),
    Named { name: String, endpoint: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedConfig {
    /// HTTP(S) URL of the snapshot feed.
    pub url: Option<String>,
    /// Directory of snapshot files, read in name order.
    pub directory: Option<String>,
    #[serde(default)]
    pub delete_after_ingest: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
        }
    }
}

/// Where `run` reads snapshots from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Url(String),
    Directory {
        path: PathBuf,
        delete_after_ingest: bool,
    },
}

fn default_poll_interval() -> u64 {
    60
}

fn default_checkpoint_path() -> String {
    "parkflow.db".to_string()
}

fn default_observer_timeout() -> u64 {
    5000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_table() -> String {
    "parking_data".to_string()
}

impl PipelineConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: PipelineConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn observer_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Get the resolved state database path.
    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(resolve_env(&self.checkpoint_path))
    }

    /// Resolve, parse and name the configured sinks.
    pub fn sinks(&self) -> ConfigResult<Vec<SinkSpec>> {
        let entries = self
            .sink_endpoints
            .iter()
            .map(|entry| match entry {
                SinkEndpointConfig::Endpoint(endpoint) => {
                    Ok((None, SinkEndpoint::parse(&resolve_env(endpoint))?))
                }
                SinkEndpointConfig::Named { name, endpoint } => Ok((
                    Some(name.clone()),
                    SinkEndpoint::parse(&resolve_env(endpoint))?,
                )),
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        name_sinks(entries)
    }

    /// The snapshot source for `run`. Exactly one of url/directory must be set.
    pub fn feed_source(&self) -> ConfigResult<FeedSource> {
        let url = self.feed.url.as_deref().map(resolve_env);
        let directory = self.feed.directory.as_deref().map(resolve_env);

        match (url, directory) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingFeed),
            (Some(url), None) if !url.trim().is_empty() => Ok(FeedSource::Url(url)),
            (None, Some(dir)) if !dir.trim().is_empty() => Ok(FeedSource::Directory {
                path: PathBuf::from(dir),
                delete_after_ingest: self.feed.delete_after_ingest,
            }),
            _ => Err(ConfigError::MissingFeed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_minimal_config() {
        let config = PipelineConfig::parse(r#"sink_endpoints = ["console"]"#).unwrap();

        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.checkpoint_path(), PathBuf::from("parkflow.db"));
        assert_eq!(config.change_policy, ChangePolicy::AvailableSpaces);
        assert_eq!(config.observer_timeout(), Duration::from_millis(5000));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.postgres.table, "parking_data");
        assert!(matches!(config.feed_source(), Err(ConfigError::MissingFeed)));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
poll_interval_seconds = 15
checkpoint_path = "/var/lib/parkflow/state.db"
sink_endpoints = [
    "console",
    "postgres://localhost/parking",
    { name = "archive", endpoint = "file://./changes.jsonl" },
]
change_policy = "available_spaces_or_closed"
observer_timeout_ms = 250
shutdown_grace_seconds = 5

[feed]
directory = "./snapshots"
delete_after_ingest = true

[retry]
max_attempts = 3
base_delay_ms = 100
max_delay_ms = 2000

[postgres]
table = "public.parking_data"
"#;
        let config = PipelineConfig::parse(toml).unwrap();

        assert_eq!(config.poll_interval_seconds, 15);
        assert_eq!(config.change_policy, ChangePolicy::AvailableSpacesOrClosed);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.retry_policy().max_delay, Duration::from_secs(2));
        assert_eq!(
            config.feed_source().unwrap(),
            FeedSource::Directory {
                path: PathBuf::from("./snapshots"),
                delete_after_ingest: true,
            }
        );

        let sinks = config.sinks().unwrap();
        let names: Vec<_> = sinks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["console", "postgres", "archive"]);
        assert!(sinks[1].endpoint.is_durable());
    }

    #[test]
    #[serial]
    fn test_endpoints_resolve_env() {
        std::env::set_var("PARKFLOW_TEST_DATABASE_URL", "postgres://db.internal/parking");
        let config =
            PipelineConfig::parse(r#"sink_endpoints = ["${PARKFLOW_TEST_DATABASE_URL}"]"#).unwrap();

        let sinks = config.sinks().unwrap();
        assert_eq!(
            sinks[0].endpoint,
            SinkEndpoint::Postgres {
                url: "postgres://db.internal/parking".to_string()
            }
        );
    }

    #[test]
    #[serial]
    fn test_unset_env_endpoint_is_invalid() {
        let config =
            PipelineConfig::parse(r#"sink_endpoints = ["${PARKFLOW_TEST_NEVER_SET}"]"#).unwrap();
        assert!(matches!(
            config.sinks(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_conflicting_feed() {
        let config = PipelineConfig::parse(
            r#"
[feed]
url = "https://example.com/feed.json"
directory = "./snapshots"
"#,
        )
        .unwrap();
        assert!(matches!(config.feed_source(), Err(ConfigError::ConflictingFeed)));
    }

    #[test]
    fn test_template_parses() {
        let config = PipelineConfig::parse(TEMPLATE).unwrap();
        assert!(matches!(config.feed_source().unwrap(), FeedSource::Url(_)));
        assert_eq!(config.sinks().unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PipelineConfig::load("/nonexistent/parkflow.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
