use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Paces snapshot fetches.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns false once no more ticks will come.
    async fn tick(&mut self) -> bool;
}

/// Fixed-period ticks. The first tick fires immediately; a tick missed
/// because a fetch ran long is delayed rather than bursted.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks on demand, for tests.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires ticks for a [`ManualTicker`]. Dropping it ends the ticker.
#[derive(Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, ManualTickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTickHandle { tx })
    }
}

impl ManualTickHandle {
    /// Returns false if the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_ticker() {
        let (mut ticker, handle) = ManualTicker::new();
        assert!(handle.tick());
        assert!(handle.tick());
        assert!(ticker.tick().await);
        assert!(ticker.tick().await);

        drop(handle);
        assert!(!ticker.tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_first_tick_is_immediate() {
        let mut ticker = IntervalTicker::new(Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        assert!(ticker.tick().await);
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(ticker.tick().await);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
