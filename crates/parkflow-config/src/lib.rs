mod endpoint;
mod env;
mod error;
mod pipeline;
mod validation;

pub use endpoint::{SinkEndpoint, SinkSpec};
pub use env::resolve_env;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{
    FeedConfig, FeedSource, PipelineConfig, PostgresConfig, RetryConfig, SinkEndpointConfig,
    TEMPLATE,
};
pub use validation::{is_plain_identifier, validate_config};
