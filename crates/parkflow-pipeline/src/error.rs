use parkflow_config::ConfigError;
use parkflow_sink::SinkError;
use parkflow_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fetching a snapshot failed; the next tick tries again.
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] parkflow_core::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sink '{sink}': {source}")]
    Sink { sink: String, source: SinkError },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(String),
}

impl PipelineError {
    /// Errors that must stop the pipeline (the durable store can no longer
    /// be trusted).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::State(_) | PipelineError::Core(_) | PipelineError::Join(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
