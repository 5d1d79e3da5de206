mod console;
mod error;
mod jsonl;
mod mock;

use async_trait::async_trait;
use parkflow_core::Batch;

pub use console::{render_batch, ConsoleSink};
pub use error::{SinkError, SinkResult};
pub use jsonl::JsonlSink;
pub use mock::MockSink;

/// How the pipeline treats a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Best effort: presented once at ingestion, failures are only logged.
    Observation,
    /// Checkpointed: retried until committed or dead-lettered.
    Durable,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Observation => "observation",
            SinkKind::Durable => "durable",
        }
    }
}

/// A downstream destination for changed records.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name; checkpoints are keyed by it.
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    /// Write one batch. A durable sink must either write all rows or report
    /// an error.
    async fn commit(&self, batch: &Batch) -> SinkResult<()>;

    /// Flush and release resources.
    async fn close(&self) -> SinkResult<()> {
        Ok(())
    }
}
