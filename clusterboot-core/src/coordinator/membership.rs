//! Membership resolution
//!
//! Turns the members of the launched groups into running addresses. The
//! directory is eventually consistent: members may still be pending, may
//! vanish, and answers arrive a page at a time.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{BootstrapError, Phase, Result};
use crate::fleet::{FleetDirectory, Lifecycle, MemberHealth, MemberId};
use crate::protocol::GroupRole;
use crate::runtime::{poll_until, DeadlineBudget, PollOutcome, Probe};

/// Running addresses, split by the role of the originating group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMembers {
    /// Master group members
    pub masters: BTreeMap<MemberId, IpAddr>,
    /// Worker group members
    pub workers: BTreeMap<MemberId, IpAddr>,
}

impl ResolvedMembers {
    /// The single master address.
    ///
    /// Anything other than exactly one resolved master violates the
    /// rendezvous precondition and is never retried.
    pub fn single_master(&self) -> Result<IpAddr> {
        let mut addresses = self.masters.values();
        match (addresses.next(), addresses.next()) {
            (Some(master), None) => Ok(*master),
            _ => Err(BootstrapError::MasterCountMismatch {
                count: self.masters.len(),
            }),
        }
    }

    /// Worker addresses in ascending order
    pub fn worker_addresses(&self) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = self.workers.values().copied().collect();
        addresses.sort();
        addresses
    }
}

/// Polls the fleet directory until every candidate is resolved
pub struct MembershipResolver {
    directory: Arc<dyn FleetDirectory>,
    interval: Duration,
}

impl MembershipResolver {
    pub fn new(directory: Arc<dyn FleetDirectory>, interval: Duration) -> Self {
        Self { directory, interval }
    }

    /// Resolve the members of `groups` to running addresses.
    ///
    /// Each group's role comes from its name. Unhealthy members are
    /// excluded for good; members that leave their group are dropped
    /// without an address.
    pub async fn resolve(&self, groups: &[String], budget: &DeadlineBudget) -> Result<ResolvedMembers> {
        info!("Resolving members of {:?} (budget {:?})", groups, budget.total());

        let mut probe = ResolveProbe {
            directory: self.directory.as_ref(),
            groups,
            origin: BTreeMap::new(),
            excluded: BTreeSet::new(),
            pending: BTreeSet::new(),
            pass: Vec::new(),
            next_token: None,
            resolved: ResolvedMembers::default(),
        };
        let resolved = poll_until(Phase::MembershipResolve, budget, self.interval, &mut probe).await?;

        info!(
            "Resolved {} master and {} worker addresses after {:?}",
            resolved.masters.len(),
            resolved.workers.len(),
            budget.elapsed()
        );
        Ok(resolved)
    }
}

struct ResolveProbe<'a> {
    directory: &'a dyn FleetDirectory,
    groups: &'a [String],
    /// Role of the group each candidate came from
    origin: BTreeMap<MemberId, GroupRole>,
    excluded: BTreeSet<MemberId>,
    pending: BTreeSet<MemberId>,
    /// Ids queried by the current pagination pass
    pass: Vec<MemberId>,
    next_token: Option<String>,
    resolved: ResolvedMembers,
}

impl ResolveProbe<'_> {
    fn is_resolved(&self, id: &MemberId) -> bool {
        self.resolved.masters.contains_key(id) || self.resolved.workers.contains_key(id)
    }

    /// Re-read group membership at the start of a pass
    async fn refresh_candidates(&mut self) -> Result<()> {
        let listed = self.directory.list_groups(self.groups).await?;
        for name in self.groups {
            if !listed.iter().any(|g| &g.name == name) {
                warn!("Launch group {} is not listed by the directory", name);
            }
        }

        let mut present = BTreeSet::new();
        for group in &listed {
            let role = GroupRole::classify(&group.name);
            for member in &group.members {
                present.insert(member.id.clone());
                if member.health == MemberHealth::Unhealthy {
                    if self.excluded.insert(member.id.clone()) {
                        warn!("Excluding unhealthy {} member {}", role, member.id);
                    }
                    self.pending.remove(&member.id);
                    continue;
                }
                if self.excluded.contains(&member.id) || self.is_resolved(&member.id) {
                    continue;
                }
                self.origin.insert(member.id.clone(), role);
                if self.pending.insert(member.id.clone()) {
                    debug!("Member {} of {} is a {} candidate", member.id, group.name, role);
                }
            }
        }

        let gone: Vec<MemberId> = self.pending.difference(&present).cloned().collect();
        for id in gone {
            info!("Member {} left its launch group, dropping it", id);
            self.pending.remove(&id);
        }
        Ok(())
    }

    fn record(&mut self, id: &MemberId, address: IpAddr) {
        let role = self.origin.get(id).copied().unwrap_or(GroupRole::Worker);
        info!("{} member {} is running at {}", role, id, address);
        match role {
            GroupRole::Master => self.resolved.masters.insert(id.clone(), address),
            GroupRole::Worker => self.resolved.workers.insert(id.clone(), address),
        };
        self.pending.remove(id);
    }
}

#[async_trait]
impl Probe for ResolveProbe<'_> {
    type Output = ResolvedMembers;

    async fn probe(&mut self) -> Result<PollOutcome<ResolvedMembers>> {
        if self.next_token.is_none() {
            self.refresh_candidates().await?;
            if self.pending.is_empty() {
                return Ok(PollOutcome::Ready(std::mem::take(&mut self.resolved)));
            }
            self.pass = self.pending.iter().cloned().collect();
        }

        let page = self
            .directory
            .describe_members(&self.pass, self.next_token.as_deref())
            .await?;

        for status in page.members {
            if !self.pending.contains(&status.id) {
                continue;
            }
            match (&status.lifecycle, status.address) {
                (Lifecycle::Running, Some(address)) => self.record(&status.id, address),
                (Lifecycle::Running, None) => {
                    debug!("Member {} is running without an address yet", status.id)
                }
                (Lifecycle::Pending, _) => debug!("Member {} is still pending", status.id),
                (other, _) => warn!("Member {} is {}, leaving it pending", status.id, other),
            }
        }
        self.next_token = page.next_token;

        if self.pending.is_empty() {
            self.next_token = None;
            return Ok(PollOutcome::Ready(std::mem::take(&mut self.resolved)));
        }
        if self.next_token.is_some() {
            return Ok(PollOutcome::Continue);
        }
        Ok(PollOutcome::Pending)
    }

    fn progress(&self) -> String {
        format!(
            "{} resolved, {} pending {:?}, {} excluded",
            self.resolved.masters.len() + self.resolved.workers.len(),
            self.pending.len(),
            self.pending.iter().map(MemberId::as_str).collect::<Vec<_>>(),
            self.excluded.len()
        )
    }
}
