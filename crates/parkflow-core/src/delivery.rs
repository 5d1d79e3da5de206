use std::time::Duration;

use crate::error::{Error, Result};

/// Delivery state of one batch at one sink.
///
/// `Pending -> Committing -> Committed | Failed`; a retryable failure goes
/// back to `Pending` on the next retry tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending { attempts: u32 },
    Committing { attempt: u32 },
    Committed { attempts: u32 },
    Failed { attempts: u32, terminal: bool },
}

impl Default for DeliveryState {
    fn default() -> Self {
        DeliveryState::Pending { attempts: 0 }
    }
}

impl DeliveryState {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryState::Pending { .. } => "pending",
            DeliveryState::Committing { .. } => "committing",
            DeliveryState::Committed { .. } => "committed",
            DeliveryState::Failed { terminal: false, .. } => "failed",
            DeliveryState::Failed { terminal: true, .. } => "failed_terminal",
        }
    }

    /// Start a commit attempt.
    pub fn begin(self) -> Result<Self> {
        match self {
            DeliveryState::Pending { attempts } => Ok(DeliveryState::Committing {
                attempt: attempts + 1,
            }),
            other => Err(other.invalid("committing")),
        }
    }

    /// The commit attempt succeeded.
    pub fn succeed(self) -> Result<Self> {
        match self {
            DeliveryState::Committing { attempt } => {
                Ok(DeliveryState::Committed { attempts: attempt })
            }
            other => Err(other.invalid("committed")),
        }
    }

    /// The commit attempt failed. The failure is terminal when the error is
    /// not retryable or the attempt budget is spent.
    pub fn fail(self, retryable: bool, policy: &RetryPolicy) -> Result<Self> {
        match self {
            DeliveryState::Committing { attempt } => Ok(DeliveryState::Failed {
                attempts: attempt,
                terminal: !retryable || attempt >= policy.max_attempts,
            }),
            other => Err(other.invalid("failed")),
        }
    }

    /// Re-arm a retryable failure.
    pub fn retry(self) -> Result<Self> {
        match self {
            DeliveryState::Failed {
                attempts,
                terminal: false,
            } => Ok(DeliveryState::Pending { attempts }),
            other => Err(other.invalid("pending")),
        }
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            DeliveryState::Pending { attempts }
            | DeliveryState::Committed { attempts }
            | DeliveryState::Failed { attempts, .. } => attempts,
            DeliveryState::Committing { attempt } => attempt,
        }
    }

    /// Committed or terminally failed; either way the sink moves on.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DeliveryState::Committed { .. } | DeliveryState::Failed { terminal: true, .. }
        )
    }

    fn invalid(self, to: &'static str) -> Error {
        Error::InvalidTransition {
            from: self.name(),
            to,
        }
    }
}

/// Bounded exponential backoff for sink commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
