//! Wall-clock budget for a bootstrap episode
//!
//! One absolute deadline is fixed when the episode starts. Each phase gets
//! a budget derived from what is left, and time is never handed back.

use tokio::time::{Duration, Instant};

use crate::error::{BootstrapError, Result};

/// Absolute deadline plus the slice of time it was created with
#[derive(Debug, Clone, Copy)]
pub struct DeadlineBudget {
    /// When this budget was created
    started: Instant,
    /// Time granted at creation
    total: Duration,
    /// Absolute deadline
    deadline: Instant,
}

impl DeadlineBudget {
    /// Create a budget that expires `total` from now
    pub fn new(total: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            total,
            deadline: now + total,
        }
    }

    /// Time left before the deadline, or `BudgetExpired` once it has passed
    pub fn remaining(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(BootstrapError::BudgetExpired);
        }
        Ok(self.deadline - now)
    }

    /// Time left, saturating at zero
    pub fn remaining_or_zero(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once the deadline has been reached
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time spent since this budget was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time granted at creation
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Absolute deadline
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Budget for the next phase after `consumed` of this one was used.
    ///
    /// The result never outlives this budget's deadline, and when
    /// `consumed` covers the whole total it is already expired.
    pub fn split(&self, consumed: Duration) -> DeadlineBudget {
        let now = Instant::now();
        let left = self.total.saturating_sub(consumed);
        let deadline = (now + left).min(self.deadline);
        Self {
            started: now,
            total: deadline.saturating_duration_since(now),
            deadline,
        }
    }
}
