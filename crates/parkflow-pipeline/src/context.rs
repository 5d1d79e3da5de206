use std::sync::Arc;
use std::time::Duration;

use parkflow_core::{parse_snapshot, ChangeDetector, ChangePolicy, RetryPolicy};
use parkflow_sink::Sink;
use parkflow_state::{SourceMarker, SqliteStore, StateError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::dispatcher::{SinkDispatcher, SinkProgress, SinkStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::source::Snapshot;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub change_policy: ChangePolicy,
    pub retry: RetryPolicy,
    pub observer_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            change_policy: ChangePolicy::default(),
            retry: RetryPolicy::default(),
            observer_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested {
        seq: u64,
        changed: usize,
        unchanged: usize,
        dropped: usize,
    },
    /// No valid records; state untouched and no batch created.
    Empty { dropped: usize },
    /// The source id was ingested before.
    Duplicate { source: String },
    /// The body could not be read, or is not JSON at all.
    Malformed { reason: String },
}

/// Counters for the lifetime of one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub snapshots: u64,
    pub duplicates: u64,
    pub malformed_snapshots: u64,
    pub records: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub dropped: u64,
    pub batches: u64,
    pub observer_failures: u64,
}

/// Everything needed to turn snapshots into delivered batches.
pub struct PipelineContext {
    checkpoints: Arc<CheckpointManager>,
    detector: ChangeDetector,
    dispatcher: SinkDispatcher,
    sinks: Vec<Arc<dyn Sink>>,
    wake: watch::Sender<u64>,
    stats: RunStats,
}

impl PipelineContext {
    /// Wire up the store and sinks and restore every durable sink's
    /// checkpoint.
    pub fn open(
        store: Arc<SqliteStore>,
        sinks: Vec<Arc<dyn Sink>>,
        options: PipelineOptions,
    ) -> PipelineResult<Self> {
        let last_seq = store.last_batch_seq()?;
        let checkpoints = Arc::new(CheckpointManager::new(store));
        let dispatcher = SinkDispatcher::new(
            sinks.clone(),
            checkpoints.clone(),
            options.retry.clone(),
            options.observer_timeout,
        )?;
        checkpoints.restore(&dispatcher.durable_names())?;

        info!(
            policy = %options.change_policy,
            last_seq,
            observers = dispatcher.observer_count(),
            durable = dispatcher.durable_names().len(),
            "Pipeline opened"
        );

        let (wake, _) = watch::channel(last_seq);
        Ok(Self {
            checkpoints,
            detector: ChangeDetector::new(options.change_policy),
            dispatcher,
            sinks,
            wake,
            stats: RunStats::default(),
        })
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn statuses(&self) -> Vec<SinkStatus> {
        self.dispatcher.statuses()
    }

    /// Detect changes in a snapshot, persist them as the next batch and hand
    /// the batch to the sinks.
    ///
    /// Snapshots are processed one at a time; the state update, sequence
    /// number and batch log entry commit together.
    pub async fn ingest(&mut self, snapshot: Snapshot) -> PipelineResult<IngestOutcome> {
        if let Some(reason) = &snapshot.unreadable {
            warn!(source = %snapshot.id, error = %reason, "Skipping unreadable snapshot");
            self.stats.malformed_snapshots += 1;
            return Ok(IngestOutcome::Malformed {
                reason: reason.clone(),
            });
        }

        let store = self.checkpoints.store().clone();
        if store.has_ingested(&snapshot.id)? {
            return Ok(self.duplicate(&snapshot).await);
        }

        let parsed = match parse_snapshot(&snapshot.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(source = %snapshot.id, error = %e, "Skipping unreadable snapshot");
                self.stats.malformed_snapshots += 1;
                return Ok(IngestOutcome::Malformed {
                    reason: e.to_string(),
                });
            }
        };

        self.stats.snapshots += 1;
        let dropped = parsed.dropped.len();
        self.stats.dropped += dropped as u64;
        for record in &parsed.dropped {
            warn!(
                source = %snapshot.id,
                index = record.index,
                facility = record.facility_key.as_deref().unwrap_or("-"),
                reason = %record.reason,
                "Dropped malformed record"
            );
        }

        if parsed.records.is_empty() {
            info!(source = %snapshot.id, dropped, "Snapshot has no valid records");
            self.cleanup(&snapshot).await;
            return Ok(IngestOutcome::Empty { dropped });
        }

        let records = parsed.records.len();
        let detection = self.detector.detect(store.as_ref(), parsed.records)?;
        let rows = detection.changed_records();
        let marker = SourceMarker {
            id: snapshot.id.clone(),
            digest: snapshot.digest.clone(),
        };

        let batch = match self.checkpoints.ingest(&detection.updates, &rows, Some(&marker)) {
            Ok(batch) => batch,
            Err(PipelineError::State(StateError::AlreadyIngested(_))) => {
                return Ok(self.duplicate(&snapshot).await);
            }
            Err(e) => return Err(e),
        };

        let changed = batch.len();
        let unchanged = records - changed;
        self.stats.records += records as u64;
        self.stats.changed += changed as u64;
        self.stats.unchanged += unchanged as u64;
        self.stats.batches += 1;

        info!(
            seq = batch.seq,
            source = %snapshot.id,
            records,
            changed,
            unchanged,
            dropped,
            "Ingested snapshot"
        );

        if !batch.is_empty() {
            self.stats.observer_failures += self.dispatcher.observe(&batch).await as u64;
        }
        self.wake.send_replace(batch.seq);

        self.checkpoints.prune(&self.dispatcher.durable_names())?;
        self.cleanup(&snapshot).await;

        Ok(IngestOutcome::Ingested {
            seq: batch.seq,
            changed,
            unchanged,
            dropped,
        })
    }

    /// Step every durable sink once (for callers that drive delivery
    /// themselves instead of spawning workers).
    pub async fn deliver(&mut self) -> PipelineResult<Vec<SinkProgress>> {
        self.dispatcher.step_all().await
    }

    /// Deliver until every durable sink is idle.
    pub async fn drain(&mut self) -> PipelineResult<Vec<SinkProgress>> {
        let progress = self.dispatcher.drain().await?;
        self.checkpoints.prune(&self.dispatcher.durable_names())?;
        Ok(progress)
    }

    /// Start one task per durable sink.
    pub fn spawn_workers(
        &mut self,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<PipelineResult<()>>> {
        self.dispatcher.spawn(&self.wake, cancel)
    }

    /// Close every sink and log a summary.
    pub async fn close(self) -> PipelineResult<RunStats> {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                warn!(sink = %sink.name(), error = %e, "Failed to close sink");
            }
        }
        self.checkpoints.prune(&self.dispatcher.durable_names())?;

        let stats = self.stats;
        info!(
            snapshots = stats.snapshots,
            batches = stats.batches,
            records = stats.records,
            changed = stats.changed,
            unchanged = stats.unchanged,
            dropped = stats.dropped,
            duplicates = stats.duplicates,
            malformed_snapshots = stats.malformed_snapshots,
            observer_failures = stats.observer_failures,
            "Pipeline closed"
        );
        Ok(stats)
    }

    async fn duplicate(&mut self, snapshot: &Snapshot) -> IngestOutcome {
        info!(source = %snapshot.id, "Snapshot already ingested, skipping");
        self.stats.duplicates += 1;
        self.cleanup(snapshot).await;
        IngestOutcome::Duplicate {
            source: snapshot.id.clone(),
        }
    }

    async fn cleanup(&self, snapshot: &Snapshot) {
        if let Some(path) = &snapshot.cleanup {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(file = %path.display(), error = %e, "Failed to remove ingested snapshot file");
            }
        }
    }
}
