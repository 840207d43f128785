//! Master rendezvous
//!
//! Watches for both launch groups, resolves their members and broadcasts
//! the resulting membership to the workers exactly once.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

use super::launch::GroupLaunchWatcher;
use super::membership::MembershipResolver;
use crate::channel::MessageChannel;
use crate::config::BootstrapConfig;
use crate::error::Result;
use crate::fleet::FleetDirectory;
use crate::protocol::{GroupRole, MembershipView};
use crate::runtime::DeadlineBudget;

/// Master side of the rendezvous
pub struct MasterCoordinator {
    watcher: GroupLaunchWatcher,
    resolver: MembershipResolver,
    worker_channel: Arc<dyn MessageChannel>,
    expected_roles: BTreeSet<GroupRole>,
}

impl MasterCoordinator {
    /// Create a coordinator reading launch notices from `master_channel`
    /// and broadcasting on `worker_channel`
    pub fn new(
        config: &BootstrapConfig,
        master_channel: Arc<dyn MessageChannel>,
        worker_channel: Arc<dyn MessageChannel>,
        directory: Arc<dyn FleetDirectory>,
    ) -> Self {
        Self {
            watcher: GroupLaunchWatcher::new(master_channel, config.poll.clone()),
            resolver: MembershipResolver::new(directory, config.poll.interval),
            worker_channel,
            expected_roles: config.expected_roles.clone(),
        }
    }

    /// Run the master rendezvous inside `budget` and return the view it
    /// broadcast
    pub async fn run(&self, budget: &DeadlineBudget) -> Result<MembershipView> {
        let ledger = self.watcher.watch(&self.expected_roles, budget).await?;

        let resolve_budget = budget.split(budget.elapsed());
        let members = self
            .resolver
            .resolve(&ledger.group_names(), &resolve_budget)
            .await?;

        let master = members.single_master()?;
        let workers = members.worker_addresses();
        let launched = ledger.launched(GroupRole::Worker);

        if workers.is_empty() {
            info!("No worker launched, master {} is the only worker", master);
        } else if workers.len() != launched as usize {
            error!(
                "Expected {} running workers, resolved {}: {:?}",
                launched,
                workers.len(),
                workers
            );
        }

        let view = MembershipView::with_master_as_worker(
            master.to_string(),
            workers.iter().map(|ip| ip.to_string()),
        );
        let body = view.to_json()?;
        let id = self.worker_channel.send(&body).await?;
        info!(
            "Broadcast membership on {} as message {}: {}",
            self.worker_channel.name(),
            id,
            body
        );

        Ok(view)
    }
}
