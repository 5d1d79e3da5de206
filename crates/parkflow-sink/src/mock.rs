use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parkflow_core::Batch;

use crate::error::{SinkError, SinkResult};
use crate::{Sink, SinkKind};

/// A scriptable sink for testing.
#[derive(Clone)]
pub struct MockSink {
    name: String,
    kind: SinkKind,
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Batches committed successfully, in commit order.
    committed: Vec<Batch>,
    /// Every commit call, successful or not.
    attempts: usize,
    /// Fail this many upcoming commits.
    fail_next: usize,
    /// If set, every commit fails with this message.
    fail_with: Option<String>,
    /// Failures are permanent instead of retryable.
    permanent: bool,
    /// Every commit sleeps this long before doing anything.
    delay: Option<Duration>,
    closed: bool,
}

impl MockSink {
    pub fn durable(name: impl Into<String>) -> Self {
        Self::new(name, SinkKind::Durable)
    }

    pub fn observer(name: impl Into<String>) -> Self {
        Self::new(name, SinkKind::Observation)
    }

    fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Fail every commit with a retryable error until [`MockSink::heal`].
    pub fn failing(self, error_message: impl Into<String>) -> Self {
        self.state.lock().unwrap().fail_with = Some(error_message.into());
        self
    }

    /// Fail every commit with a permanent error.
    pub fn rejecting(self, error_message: impl Into<String>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.fail_with = Some(error_message.into());
            state.permanent = true;
        }
        self
    }

    /// Fail the next `n` commits with a retryable error.
    pub fn fail_times(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_next = n;
        self
    }

    /// Make every commit take `delay`.
    pub fn slow(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = Some(delay);
        self
    }

    /// Stop failing.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_with = None;
        state.fail_next = 0;
    }

    /// All successfully committed batches.
    pub fn batches(&self) -> Vec<Batch> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Sequence numbers of committed batches, in commit order.
    pub fn committed_seqs(&self) -> Vec<u64> {
        self.batches().iter().map(|b| b.seq).collect()
    }

    /// Total number of rows across committed batches.
    pub fn total_rows(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .committed
            .iter()
            .map(|b| b.rows.len())
            .sum()
    }

    /// Number of commit calls, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Clear all recorded commits.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.committed.clear();
        state.attempts = 0;
    }
}

#[async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn commit(&self, batch: &Batch) -> SinkResult<()> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.attempts += 1;

        let failure = match state.fail_with.clone() {
            Some(message) => Some(message),
            None if state.fail_next > 0 => {
                state.fail_next -= 1;
                Some("simulated failure".to_string())
            }
            None => None,
        };

        match failure {
            Some(message) if state.permanent => Err(SinkError::Rejected(message)),
            Some(message) => Err(SinkError::Connection(message)),
            None => {
                state.committed.push(batch.clone());
                Ok(())
            }
        }
    }

    async fn close(&self) -> SinkResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
