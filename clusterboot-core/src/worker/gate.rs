//! Instance role gate
//!
//! Nothing else can authenticate until the instance role's credentials are
//! served by instance metadata, so every node waits for them first.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aws::{InstanceMetadataClient, RoleCredentials};
use crate::error::{BootstrapError, Phase, Result};
use crate::runtime::{poll_until, DeadlineBudget, PollOutcome, Probe};

/// Where role credential records come from
#[async_trait]
pub trait RoleCredentialSource: Send + Sync {
    /// The role's credential record, or `None` while it is not attached
    async fn role_credentials(&self, role: &str) -> Result<Option<RoleCredentials>>;
}

#[async_trait]
impl RoleCredentialSource for InstanceMetadataClient {
    async fn role_credentials(&self, role: &str) -> Result<Option<RoleCredentials>> {
        InstanceMetadataClient::role_credentials(self, role).await
    }
}

/// Polls for a role's credential record
pub struct InstanceRoleGate {
    source: Arc<dyn RoleCredentialSource>,
    interval: Duration,
}

impl InstanceRoleGate {
    pub fn new(source: Arc<dyn RoleCredentialSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// True as soon as `role` has a usable credential record, false once
    /// `budget` runs out
    pub async fn await_role(&self, role: &str, budget: &DeadlineBudget) -> Result<bool> {
        info!("Checking for instance role {} (budget {:?})", role, budget.total());

        let mut probe = RoleProbe {
            source: self.source.as_ref(),
            role,
            attempts: 0,
        };
        match poll_until(Phase::RoleGate, budget, self.interval, &mut probe).await {
            Ok(()) => Ok(true),
            Err(BootstrapError::Timeout { .. }) => {
                warn!("Instance role {} not available after {:?}", role, budget.elapsed());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

struct RoleProbe<'a> {
    source: &'a dyn RoleCredentialSource,
    role: &'a str,
    attempts: u32,
}

#[async_trait]
impl Probe for RoleProbe<'_> {
    type Output = ();

    async fn probe(&mut self) -> Result<PollOutcome<()>> {
        self.attempts += 1;
        match self.source.role_credentials(self.role).await {
            Ok(Some(record)) if record.is_success() => {
                // Debug output of the record carries no key material
                info!("Instance role {} available: {:?}", self.role, record);
                Ok(PollOutcome::Ready(()))
            }
            Ok(Some(record)) => {
                info!("Instance role {} not ready yet (code {})", self.role, record.code);
                Ok(PollOutcome::Pending)
            }
            Ok(None) => {
                info!("Instance role {} not attached yet", self.role);
                Ok(PollOutcome::Pending)
            }
            Err(e) => {
                warn!("Failed to read instance role {}: {}", self.role, e);
                Ok(PollOutcome::Pending)
            }
        }
    }

    fn progress(&self) -> String {
        format!("role {} checked {} times", self.role, self.attempts)
    }
}
