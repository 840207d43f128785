//! Poll-until primitive shared by every waiting phase
//!
//! A phase supplies a [`Probe`]; the loop runs it, sleeps
//! `min(interval, remaining)` between unproductive attempts and stops with
//! a timeout once the budget is gone.

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::budget::DeadlineBudget;
use crate::error::{BootstrapError, Phase, Result};

/// Result of one probe attempt
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The awaited condition holds
    Ready(T),
    /// Not yet; sleep before the next attempt
    Pending,
    /// Not yet, but more work is immediately available (e.g. another page)
    Continue,
}

/// One step of a polling phase
#[async_trait]
pub trait Probe: Send {
    /// Value produced once the condition holds
    type Output: Send;

    /// Run a single attempt
    async fn probe(&mut self) -> Result<PollOutcome<Self::Output>>;

    /// Short progress summary used in logs and timeout errors
    fn progress(&self) -> String;
}

/// Run `probe` until it is ready or `budget` runs out.
///
/// Retryable transport errors count as an unproductive attempt; any other
/// error ends the phase immediately.
pub async fn poll_until<P: Probe>(
    phase: Phase,
    budget: &DeadlineBudget,
    interval: Duration,
    probe: &mut P,
) -> Result<P::Output> {
    let mut attempt: u64 = 0;

    loop {
        if budget.is_expired() {
            let detail = probe.progress();
            warn!(
                "{} timed out after {:?} of {:?} ({} attempts): {}",
                phase,
                budget.elapsed(),
                budget.total(),
                attempt,
                detail
            );
            return Err(BootstrapError::Timeout {
                phase,
                elapsed: budget.elapsed(),
                budget: budget.total(),
                detail,
            });
        }

        attempt += 1;
        let outcome = match probe.probe().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                warn!("{} attempt {} hit a retryable error: {}", phase, attempt, e);
                PollOutcome::Pending
            }
            Err(e) => return Err(e),
        };

        match outcome {
            PollOutcome::Ready(value) => {
                debug!("{} ready after {} attempts in {:?}", phase, attempt, budget.elapsed());
                return Ok(value);
            }
            PollOutcome::Continue => continue,
            PollOutcome::Pending => {
                let remaining = budget.remaining_or_zero();
                if remaining.is_zero() {
                    continue;
                }
                let wait = interval.min(remaining);
                info!(
                    "{} not complete ({}), waiting {:?} before attempt {}",
                    phase,
                    probe.progress(),
                    wait,
                    attempt + 1
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}
