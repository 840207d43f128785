//! One bootstrap episode, start to finish
//!
//! Role gate first, then the role's rendezvous, then local provisioning.
//! Every phase draws from the same deadline.

use std::sync::Arc;
use tracing::info;

use super::budget::DeadlineBudget;
use crate::channel::MessageChannel;
use crate::config::{BootstrapConfig, NodeRole};
use crate::coordinator::MasterCoordinator;
use crate::error::{BootstrapError, Result};
use crate::fleet::FleetDirectory;
use crate::protocol::MembershipView;
use crate::provision::{CompletionSignal, MembershipSink};
use crate::worker::{InstanceRoleGate, RoleCredentialSource, WorkerRendezvous};

/// External services an episode talks to
pub struct EpisodeServices {
    /// Source of the instance role's credential record
    pub role_source: Arc<dyn RoleCredentialSource>,
    /// Queue carrying launch notices
    pub master_channel: Arc<dyn MessageChannel>,
    /// Queue carrying the membership broadcast
    pub worker_channel: Arc<dyn MessageChannel>,
    pub directory: Arc<dyn FleetDirectory>,
    pub sink: Arc<dyn MembershipSink>,
    pub signal: Arc<dyn CompletionSignal>,
}

/// The full bootstrap sequence for one node
pub struct BootstrapEpisode {
    config: BootstrapConfig,
    services: EpisodeServices,
}

impl BootstrapEpisode {
    pub fn new(config: BootstrapConfig, services: EpisodeServices) -> Self {
        Self { config, services }
    }

    /// Run the episode under a fresh budget
    pub async fn run(&self) -> Result<MembershipView> {
        let budget = DeadlineBudget::new(self.config.available_budget());
        self.run_with_budget(&budget).await
    }

    /// Run the episode under `budget`
    pub async fn run_with_budget(&self, budget: &DeadlineBudget) -> Result<MembershipView> {
        info!(
            "Starting {} bootstrap with a budget of {:?}",
            self.config.role,
            budget.total()
        );

        let gate = InstanceRoleGate::new(self.services.role_source.clone(), self.config.poll.interval);
        if !gate.await_role(&self.config.role_name, budget).await? {
            return Err(BootstrapError::RoleUnavailable {
                role: self.config.role_name.clone(),
            });
        }

        let remaining = budget.split(budget.elapsed());
        info!("Instance role ready, {:?} left for the rendezvous", remaining.total());

        let view = match self.config.role {
            NodeRole::Master => {
                let coordinator = MasterCoordinator::new(
                    &self.config,
                    self.services.master_channel.clone(),
                    self.services.worker_channel.clone(),
                    self.services.directory.clone(),
                );
                let view = coordinator.run(&remaining).await?;
                self.services.sink.apply(&view).await?;
                self.services.signal.signal_success().await?;
                view
            }
            NodeRole::Worker => {
                let rendezvous =
                    WorkerRendezvous::new(self.services.worker_channel.clone(), self.config.poll.clone());
                let view = rendezvous.await_view(&remaining).await?;
                self.services.sink.apply(&view).await?;
                view
            }
        };

        info!("Bootstrap finished after {:?}", budget.elapsed());
        Ok(view)
    }
}
