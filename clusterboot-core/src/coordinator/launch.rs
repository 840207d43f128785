//! Launch-group watcher
//!
//! Drains launch notices from the master queue into an idempotent ledger
//! until every expected group role has reported a successful launch.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::{ChannelMessage, MessageChannel};
use crate::config::PollSettings;
use crate::error::{Phase, Result};
use crate::protocol::{ChannelEvent, GroupLaunchNotice, GroupRole};
use crate::runtime::{poll_until, DeadlineBudget, PollOutcome, Probe};

/// Result of merging one notice into the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First success notice for this group
    Inserted,
    /// The group was already recorded; the notice is discarded
    Duplicate,
    /// Not a success notice; nothing recorded
    Ignored,
}

/// Successful launch notices keyed by group, first write wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchNoticeLedger {
    notices: Vec<GroupLaunchNotice>,
}

impl LaunchNoticeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a notice. Only success notices are recorded, and only the
    /// first one per group.
    pub fn merge(&mut self, notice: GroupLaunchNotice) -> MergeOutcome {
        if !notice.is_success() {
            return MergeOutcome::Ignored;
        }
        if self.notices.iter().any(|n| n.group == notice.group) {
            return MergeOutcome::Duplicate;
        }
        self.notices.push(notice);
        MergeOutcome::Inserted
    }

    /// True once every role in `expected` is covered by a recorded group
    pub fn is_complete(&self, expected: &BTreeSet<GroupRole>) -> bool {
        expected.iter().all(|role| self.group(*role).is_some())
    }

    /// First recorded notice for `role`
    pub fn group(&self, role: GroupRole) -> Option<&GroupLaunchNotice> {
        self.notices.iter().find(|n| n.role == role)
    }

    /// All recorded notices, in arrival order
    pub fn notices(&self) -> &[GroupLaunchNotice] {
        &self.notices
    }

    /// Recorded group names, in arrival order
    pub fn group_names(&self) -> Vec<String> {
        self.notices.iter().map(|n| n.group.clone()).collect()
    }

    /// Members launched across the recorded groups of `role`
    pub fn launched(&self, role: GroupRole) -> u32 {
        self.notices
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.launched)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

/// Polls the master queue for launch notices
pub struct GroupLaunchWatcher {
    channel: Arc<dyn MessageChannel>,
    poll: PollSettings,
}

impl GroupLaunchWatcher {
    pub fn new(channel: Arc<dyn MessageChannel>, poll: PollSettings) -> Self {
        Self { channel, poll }
    }

    /// Wait until every role in `expected` has a success notice
    pub async fn watch(
        &self,
        expected: &BTreeSet<GroupRole>,
        budget: &DeadlineBudget,
    ) -> Result<LaunchNoticeLedger> {
        info!(
            "Waiting for launch notices of {:?} on {} (budget {:?})",
            expected,
            self.channel.name(),
            budget.total()
        );

        let mut probe = LaunchProbe {
            channel: self.channel.as_ref(),
            batch_size: self.poll.batch_size,
            visibility: self.poll.launch_visibility,
            expected,
            ledger: LaunchNoticeLedger::new(),
        };
        let ledger = poll_until(Phase::LaunchWatch, budget, self.poll.interval, &mut probe).await?;

        info!(
            "All launch groups reported success after {:?}: {:?}",
            budget.elapsed(),
            ledger.group_names()
        );
        Ok(ledger)
    }
}

struct LaunchProbe<'a> {
    channel: &'a dyn MessageChannel,
    batch_size: u32,
    visibility: Duration,
    expected: &'a BTreeSet<GroupRole>,
    ledger: LaunchNoticeLedger,
}

impl LaunchProbe<'_> {
    /// Returns true when the message should be deleted
    fn absorb(&mut self, message: &ChannelMessage) -> bool {
        let notice = match ChannelEvent::parse(&message.body) {
            Ok(ChannelEvent::Launch(notice)) => notice,
            Ok(other) => {
                debug!("Discarding non-launch message {}: {:?}", message.id, other);
                return true;
            }
            Err(e) => {
                warn!(
                    "Leaving malformed message {} on {}: {} (body: {})",
                    message.id,
                    self.channel.name(),
                    e,
                    message.body
                );
                return false;
            }
        };

        let group = notice.group.clone();
        let role = notice.role;
        match self.ledger.merge(notice) {
            MergeOutcome::Inserted => info!("Launch group {} ({}) succeeded", group, role),
            MergeOutcome::Duplicate => info!("Duplicate launch notice for {}, discarding", group),
            MergeOutcome::Ignored => warn!("Launch group {} reported a non-success status", group),
        }
        true
    }
}

#[async_trait]
impl Probe for LaunchProbe<'_> {
    type Output = LaunchNoticeLedger;

    async fn probe(&mut self) -> Result<PollOutcome<LaunchNoticeLedger>> {
        let messages = self.channel.receive(self.batch_size, self.visibility).await?;
        debug!("Received {} messages from {}", messages.len(), self.channel.name());

        for message in &messages {
            if self.absorb(message) {
                if let Err(e) = self.channel.delete(message).await {
                    warn!("Failed to delete message {}: {}", message.id, e);
                }
            }
        }

        if self.ledger.is_complete(self.expected) {
            return Ok(PollOutcome::Ready(std::mem::take(&mut self.ledger)));
        }
        Ok(PollOutcome::Pending)
    }

    fn progress(&self) -> String {
        let covered = self
            .expected
            .iter()
            .filter(|role| self.ledger.group(**role).is_some())
            .count();
        format!(
            "{} of {} expected group roles reported success ({:?})",
            covered,
            self.expected.len(),
            self.ledger.group_names()
        )
    }
}
