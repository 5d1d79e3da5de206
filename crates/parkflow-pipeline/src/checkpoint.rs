use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parkflow_core::{Batch, Record, StateEntry};
use parkflow_state::{Checkpoint, CheckpointStore, SourceMarker, SqliteStore};
use tracing::{debug, info};

use crate::error::PipelineResult;

/// Assigns batch sequence numbers and tracks how far each durable sink has
/// got through them.
///
/// All reads go to the store, so a new manager over the same database picks
/// up exactly where the previous process stopped.
pub struct CheckpointManager {
    store: Arc<SqliteStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Persist a snapshot's state updates and changed rows as the next batch.
    pub fn ingest(
        &self,
        updates: &BTreeMap<String, StateEntry>,
        rows: &[Record],
        source: Option<&SourceMarker>,
    ) -> PipelineResult<Batch> {
        Ok(self.store.ingest(updates, rows, source, Utc::now())?)
    }

    /// Load and log the checkpoints of the given sinks. Sinks seen for the
    /// first time start at 0.
    pub fn restore(&self, sinks: &[&str]) -> PipelineResult<Vec<(String, u64)>> {
        let last = self.store.last_batch_seq()?;
        let mut restored = Vec::with_capacity(sinks.len());

        for name in sinks {
            let seq = self.committed(name)?;
            if seq > 0 {
                info!(sink = %name, seq, lag = last.saturating_sub(seq), "Restored checkpoint");
            } else {
                info!(sink = %name, "No checkpoint, starting from the batch log head");
            }
            restored.push((name.to_string(), seq));
        }

        Ok(restored)
    }

    /// Last batch settled at this sink (0 if none).
    pub fn committed(&self, sink: &str) -> PipelineResult<u64> {
        Ok(self
            .store
            .get_checkpoint(sink)?
            .map(|c| c.seq)
            .unwrap_or(0))
    }

    /// Record that `seq` (with `rows` rows) is committed at `sink`. Never
    /// moves a checkpoint backwards.
    pub fn advance(&self, sink: &str, seq: u64, rows: usize) -> PipelineResult<()> {
        let current = self.store.get_checkpoint(sink)?.unwrap_or_default();
        if seq <= current.seq {
            debug!(sink, seq, current = current.seq, "Checkpoint already past batch");
            return Ok(());
        }

        let checkpoint = Checkpoint {
            seq,
            rows_committed: current.rows_committed + rows as u64,
            updated_at: Some(Utc::now()),
        };
        self.store.save_checkpoint(sink, &checkpoint)?;
        Ok(())
    }

    /// Park a batch in the dead letter queue and move the sink past it.
    pub fn dead_letter(
        &self,
        sink: &str,
        batch: &Batch,
        error_message: &str,
        attempts: u32,
    ) -> PipelineResult<i64> {
        Ok(self
            .store
            .dead_letter(sink, batch, error_message, attempts)?)
    }

    /// The oldest logged batch this sink has not settled yet.
    pub fn next_pending(&self, sink: &str) -> PipelineResult<Option<Batch>> {
        let after = self.committed(sink)?;
        Ok(self.store.pending_batches(after, 1)?.into_iter().next())
    }

    /// Drop batches every given sink has settled. With no durable sinks the
    /// whole log is dropped.
    pub fn prune(&self, sinks: &[&str]) -> PipelineResult<usize> {
        let through = if sinks.is_empty() {
            self.store.last_batch_seq()?
        } else {
            let mut min = u64::MAX;
            for name in sinks {
                min = min.min(self.committed(name)?);
            }
            min
        };

        if through == 0 {
            return Ok(0);
        }
        Ok(self.store.prune_batches_through(through)?)
    }
}
