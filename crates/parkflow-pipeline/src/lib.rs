mod checkpoint;
mod context;
mod dispatcher;
mod error;
mod run;
mod scheduler;
mod sinks;
mod source;

pub use checkpoint::CheckpointManager;
pub use context::{IngestOutcome, PipelineContext, PipelineOptions, RunStats};
pub use dispatcher::{SinkDispatcher, SinkProgress, SinkStatus, SinkWorker};
pub use error::{PipelineError, PipelineResult};
pub use run::{run_pipeline, shutdown_signal};
pub use scheduler::{IntervalTicker, ManualTickHandle, ManualTicker, Ticker};
pub use sinks::build_sinks;
pub use source::{DirectorySource, HttpSource, Snapshot, SnapshotSource};
