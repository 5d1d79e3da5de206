//! Delivery of logged batches to sinks.
//!
//! Observation sinks see each batch once, at ingestion. Every durable sink
//! gets a [`SinkWorker`] that walks the batch log from its own checkpoint,
//! so a slow or failing sink never holds back the others.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parkflow_core::{Batch, DeliveryState, RetryPolicy};
use parkflow_sink::{Sink, SinkKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::error::PipelineResult;

/// What one [`SinkWorker::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkProgress {
    /// Nothing left to deliver.
    Idle,
    Committed { seq: u64, rows: usize },
    RetryScheduled { seq: u64, attempt: u32, delay: Duration },
    DeadLettered { seq: u64, attempts: u32 },
}

/// Last known state of a durable sink, published by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkStatus {
    pub name: String,
    pub committed_seq: u64,
    pub state: &'static str,
    pub dead_lettered: u64,
    pub last_error: Option<String>,
}

impl SinkStatus {
    fn new(name: &str, committed_seq: u64) -> Self {
        Self {
            name: name.to_string(),
            committed_seq,
            state: "idle",
            dead_lettered: 0,
            last_error: None,
        }
    }
}

/// Drives one durable sink through the batch log.
pub struct SinkWorker {
    sink: Arc<dyn Sink>,
    checkpoints: Arc<CheckpointManager>,
    retry: RetryPolicy,
    current: Option<(Batch, DeliveryState)>,
    status: watch::Sender<SinkStatus>,
}

impl SinkWorker {
    pub fn new(
        sink: Arc<dyn Sink>,
        checkpoints: Arc<CheckpointManager>,
        retry: RetryPolicy,
    ) -> PipelineResult<Self> {
        let committed = checkpoints.committed(sink.name())?;
        let (status, _) = watch::channel(SinkStatus::new(sink.name(), committed));
        Ok(Self {
            sink,
            checkpoints,
            retry,
            current: None,
            status,
        })
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn subscribe(&self) -> watch::Receiver<SinkStatus> {
        self.status.subscribe()
    }

    /// Make one delivery transition for the batch after this sink's
    /// checkpoint.
    ///
    /// Never sleeps: a retryable failure re-arms the batch and reports the
    /// backoff delay for the caller to wait out.
    pub async fn step(&mut self) -> PipelineResult<SinkProgress> {
        let (batch, state) = match self.current.take() {
            Some(current) => current,
            None => match self.checkpoints.next_pending(self.sink.name())? {
                Some(batch) => (batch, DeliveryState::default()),
                None => {
                    self.publish(|s| s.state = "idle");
                    return Ok(SinkProgress::Idle);
                }
            },
        };

        // Nothing to write; the sink is not called for empty batches.
        if batch.is_empty() {
            self.checkpoints.advance(self.sink.name(), batch.seq, 0)?;
            self.publish(|s| s.committed_seq = batch.seq);
            return Ok(SinkProgress::Committed {
                seq: batch.seq,
                rows: 0,
            });
        }

        let state = state.begin()?;
        self.publish(|s| s.state = state.name());

        match self.sink.commit(&batch).await {
            Ok(()) => {
                let state = state.succeed()?;
                self.checkpoints
                    .advance(self.sink.name(), batch.seq, batch.len())?;
                debug!(
                    sink = %self.sink.name(),
                    seq = batch.seq,
                    rows = batch.len(),
                    attempts = state.attempts(),
                    "Batch committed"
                );
                self.publish(|s| {
                    s.committed_seq = batch.seq;
                    s.state = state.name();
                    s.last_error = None;
                });
                Ok(SinkProgress::Committed {
                    seq: batch.seq,
                    rows: batch.len(),
                })
            }
            Err(e) => {
                let state = state.fail(e.is_retryable(), &self.retry)?;
                let attempts = state.attempts();
                let message = e.to_string();

                if state.is_settled() {
                    let id = self.checkpoints.dead_letter(
                        self.sink.name(),
                        &batch,
                        &message,
                        attempts,
                    )?;
                    error!(
                        sink = %self.sink.name(),
                        seq = batch.seq,
                        attempts,
                        dead_letter_id = id,
                        error = %message,
                        "Batch failed permanently, moved to dead letter queue"
                    );
                    self.publish(|s| {
                        s.committed_seq = batch.seq;
                        s.state = state.name();
                        s.dead_lettered += 1;
                        s.last_error = Some(message);
                    });
                    return Ok(SinkProgress::DeadLettered {
                        seq: batch.seq,
                        attempts,
                    });
                }

                let delay = self.retry.backoff(attempts);
                warn!(
                    sink = %self.sink.name(),
                    seq = batch.seq,
                    attempt = attempts,
                    max_attempts = self.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Commit failed, retrying"
                );
                self.publish(|s| {
                    s.state = state.name();
                    s.last_error = Some(message);
                });
                let seq = batch.seq;
                self.current = Some((batch, state.retry()?));
                Ok(SinkProgress::RetryScheduled {
                    seq,
                    attempt: attempts,
                    delay,
                })
            }
        }
    }

    /// Run until cancelled, waking on new batches or retry deadlines.
    ///
    /// Cancellation is only observed between commits; an in-flight commit
    /// runs to completion unless the task is aborted.
    pub async fn run(
        mut self,
        mut wake: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> PipelineResult<()> {
        info!(sink = %self.sink.name(), "Sink worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            wake.borrow_and_update();

            let progress = match self.step().await {
                Ok(progress) => progress,
                Err(e) => {
                    error!(sink = %self.sink.name(), error = %e, "Sink worker failed");
                    cancel.cancel();
                    return Err(e);
                }
            };

            match progress {
                SinkProgress::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = wake.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                SinkProgress::RetryScheduled { delay, .. } => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                SinkProgress::Committed { .. } | SinkProgress::DeadLettered { .. } => {}
            }
        }

        info!(sink = %self.sink.name(), "Sink worker stopped");
        Ok(())
    }

    fn publish(&self, update: impl FnOnce(&mut SinkStatus)) {
        self.status.send_modify(update);
    }
}

/// Fans batches out to observation sinks and owns the durable workers.
pub struct SinkDispatcher {
    observers: Vec<Arc<dyn Sink>>,
    workers: Vec<SinkWorker>,
    statuses: Vec<watch::Receiver<SinkStatus>>,
    durable_names: Vec<String>,
    observer_timeout: Duration,
}

impl SinkDispatcher {
    pub fn new(
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: Arc<CheckpointManager>,
        retry: RetryPolicy,
        observer_timeout: Duration,
    ) -> PipelineResult<Self> {
        let mut observers = Vec::new();
        let mut workers = Vec::new();

        for sink in sinks {
            match sink.kind() {
                SinkKind::Observation => observers.push(sink),
                SinkKind::Durable => {
                    workers.push(SinkWorker::new(sink, checkpoints.clone(), retry.clone())?)
                }
            }
        }

        let statuses = workers.iter().map(SinkWorker::subscribe).collect();
        let durable_names = workers.iter().map(|w| w.name().to_string()).collect();

        Ok(Self {
            observers,
            workers,
            statuses,
            durable_names,
            observer_timeout,
        })
    }

    pub fn durable_names(&self) -> Vec<&str> {
        self.durable_names.iter().map(String::as_str).collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Latest status of every durable sink.
    pub fn statuses(&self) -> Vec<SinkStatus> {
        self.statuses.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Present a batch to every observation sink concurrently. Failures and
    /// timeouts are logged and counted, never retried.
    pub async fn observe(&self, batch: &Batch) -> usize {
        let timeout = self.observer_timeout;
        let results = join_all(self.observers.iter().map(|sink| async move {
            let result = tokio::time::timeout(timeout, sink.commit(batch)).await;
            (sink.name(), result)
        }))
        .await;

        let mut failures = 0;
        for (name, result) in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(sink = %name, seq = batch.seq, error = %e, "Observation sink failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(
                        sink = %name,
                        seq = batch.seq,
                        timeout_ms = timeout.as_millis() as u64,
                        "Observation sink timed out"
                    );
                }
            }
        }
        failures
    }

    /// Step every durable worker once, concurrently.
    pub async fn step_all(&mut self) -> PipelineResult<Vec<SinkProgress>> {
        let results = join_all(self.workers.iter_mut().map(|w| w.step())).await;
        results.into_iter().collect()
    }

    /// Step all workers until every one is idle, ignoring backoff delays.
    pub async fn drain(&mut self) -> PipelineResult<Vec<SinkProgress>> {
        let mut all = Vec::new();
        loop {
            let progress = self.step_all().await?;
            if progress.iter().all(|p| *p == SinkProgress::Idle) {
                return Ok(all);
            }
            all.extend(progress.into_iter().filter(|p| *p != SinkProgress::Idle));
        }
    }

    /// Move every durable worker onto its own task. Observation sinks stay
    /// with the dispatcher.
    pub fn spawn(
        &mut self,
        wake: &watch::Sender<u64>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<PipelineResult<()>>> {
        std::mem::take(&mut self.workers)
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(wake.subscribe(), cancel.clone())))
            .collect()
    }
}
