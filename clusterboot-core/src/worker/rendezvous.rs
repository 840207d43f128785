//! Worker rendezvous
//!
//! Workers read the worker queue without consuming it: the broadcast must
//! stay visible so every worker sees the same message.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::PollSettings;
use crate::error::{Phase, Result};
use crate::protocol::{ChannelEvent, MembershipView};
use crate::runtime::{poll_until, DeadlineBudget, PollOutcome, Probe};

/// Waits for the master's membership broadcast
pub struct WorkerRendezvous {
    channel: Arc<dyn MessageChannel>,
    poll: PollSettings,
}

impl WorkerRendezvous {
    pub fn new(channel: Arc<dyn MessageChannel>, poll: PollSettings) -> Self {
        Self { channel, poll }
    }

    /// Block until a broadcast is observed or `budget` runs out
    pub async fn await_view(&self, budget: &DeadlineBudget) -> Result<MembershipView> {
        info!(
            "Waiting for membership broadcast on {} (budget {:?})",
            self.channel.name(),
            budget.total()
        );

        let mut probe = BroadcastProbe {
            channel: self.channel.as_ref(),
            batch_size: self.poll.batch_size,
            seen: 0,
        };
        let view = poll_until(Phase::BroadcastWait, budget, self.poll.interval, &mut probe).await?;

        info!(
            "Received membership after {:?}: master {}, workers {:?}",
            budget.elapsed(),
            view.master(),
            view.workers()
        );
        Ok(view)
    }
}

struct BroadcastProbe<'a> {
    channel: &'a dyn MessageChannel,
    batch_size: u32,
    seen: usize,
}

#[async_trait]
impl Probe for BroadcastProbe<'_> {
    type Output = MembershipView;

    async fn probe(&mut self) -> Result<PollOutcome<MembershipView>> {
        // Zero visibility: the message is never hidden from other workers
        let messages = self.channel.receive(self.batch_size, Duration::ZERO).await?;
        self.seen += messages.len();

        for message in messages {
            match ChannelEvent::parse(&message.body) {
                Ok(ChannelEvent::WorkerSetup(view)) => return Ok(PollOutcome::Ready(view)),
                Ok(other) => debug!("Ignoring message {}: {:?}", message.id, other),
                Err(e) => warn!("Ignoring malformed message {}: {} (body: {})", message.id, e, message.body),
            }
        }
        Ok(PollOutcome::Pending)
    }

    fn progress(&self) -> String {
        format!("no worker-setup broadcast among {} messages read", self.seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::error::BootstrapError;

    fn view() -> MembershipView {
        MembershipView::with_master_as_worker("10.0.0.1", ["10.0.0.3", "10.0.0.2"])
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_other_messages_and_keeps_broadcast() {
        let channel = Arc::new(InMemoryChannel::new("worker"));
        channel.push("garbage");
        channel.push(r#"{"event":"asg-setup","status":"success","asg":"x","launched":1}"#);
        let id = channel.push(view().to_json().unwrap());

        let rendezvous = WorkerRendezvous::new(channel.clone(), PollSettings::default());
        let received = rendezvous
            .await_view(&DeadlineBudget::new(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(received, view());
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.receive_count(&id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_arriving_later() {
        let channel = Arc::new(InMemoryChannel::new("worker"));
        let producer = {
            let channel = channel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(40)).await;
                channel.push(view().to_json().unwrap());
            }
        };

        let rendezvous = WorkerRendezvous::new(channel, PollSettings::default());
        let started = tokio::time::Instant::now();
        let budget = DeadlineBudget::new(Duration::from_secs(300));
        let (received, _) = tokio::join!(rendezvous.await_view(&budget), producer);

        assert_eq!(received.unwrap(), view());
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_broadcast() {
        let channel = Arc::new(InMemoryChannel::new("worker"));
        let rendezvous = WorkerRendezvous::new(channel, PollSettings::default());

        let err = rendezvous
            .await_view(&DeadlineBudget::new(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout { phase: Phase::BroadcastWait, .. }));
    }
}
