mod error;
mod sqlite;

use chrono::{DateTime, Utc};
use parkflow_core::Record;

pub use error::{StateError, StateResult};
pub use sqlite::SqliteStore;

/// Delivery progress of one sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    /// The last batch sequence number settled at this sink.
    pub seq: u64,
    /// Number of rows committed so far.
    pub rows_committed: u64,
    /// Last update timestamp.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Identifies the snapshot a batch was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMarker {
    pub id: String,
    /// Hex SHA-256 of the snapshot body.
    pub digest: String,
}

/// A batch a sink gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    pub sink_name: String,
    pub seq: u64,
    pub rows: Vec<Record>,
    pub error_message: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub facilities: u64,
    pub last_batch_seq: u64,
    pub logged_batches: u64,
    pub dead_letters: u64,
}

/// Trait for checkpoint storage backends.
pub trait CheckpointStore: Send + Sync {
    /// Get the checkpoint for a sink.
    fn get_checkpoint(&self, sink_name: &str) -> StateResult<Option<Checkpoint>>;

    /// Save a checkpoint for a sink. Checkpoints never move backwards.
    fn save_checkpoint(&self, sink_name: &str, checkpoint: &Checkpoint) -> StateResult<()>;

    /// Get all checkpoints.
    fn get_all_checkpoints(&self) -> StateResult<Vec<(String, Checkpoint)>>;

    /// Get the minimum sequence number across all sinks.
    fn get_min_seq(&self) -> StateResult<Option<u64>> {
        let checkpoints = self.get_all_checkpoints()?;
        Ok(checkpoints.iter().map(|(_, c)| c.seq).min())
    }
}
