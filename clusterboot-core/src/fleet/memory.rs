//! In-process fleet directory

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::{FleetDirectory, GroupMember, LaunchGroup, Lifecycle, MemberHealth, MemberId, MemberPage, MemberStatus};
use crate::error::{BootstrapError, Result};

#[derive(Default)]
struct DirectoryState {
    groups: BTreeMap<String, Vec<GroupMember>>,
    members: BTreeMap<MemberId, (Lifecycle, Option<IpAddr>)>,
    describe_calls: usize,
}

/// Directory whose contents tests mutate between polls.
///
/// `describe_members` returns at most `page_size` known members per call,
/// with an offset as the next-page token. Unknown ids are omitted.
pub struct StaticDirectory {
    page_size: usize,
    state: Mutex<DirectoryState>,
}

impl StaticDirectory {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(DirectoryState::default()),
        }
    }

    /// Add a group with healthy members
    pub fn add_group(&self, name: impl Into<String>, ids: &[&str]) {
        let members = ids
            .iter()
            .map(|id| GroupMember {
                id: MemberId::new(*id),
                health: MemberHealth::Healthy,
            })
            .collect();
        self.state.lock().groups.insert(name.into(), members);
    }

    /// Change a group member's health
    pub fn set_health(&self, id: &str, health: MemberHealth) {
        let mut state = self.state.lock();
        for member in state.groups.values_mut().flatten() {
            if member.id.as_str() == id {
                member.health = health;
            }
        }
    }

    /// Insert or update a member's lifecycle state and address
    pub fn set_member(&self, id: &str, lifecycle: Lifecycle, address: Option<IpAddr>) {
        self.state
            .lock()
            .members
            .insert(MemberId::new(id), (lifecycle, address));
    }

    /// Remove a member from the directory and from every group
    pub fn remove_member(&self, id: &str) {
        let mut state = self.state.lock();
        state.members.remove(&MemberId::new(id));
        for members in state.groups.values_mut() {
            members.retain(|m| m.id.as_str() != id);
        }
    }

    /// Number of `describe_members` calls served
    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }
}

#[async_trait]
impl FleetDirectory for StaticDirectory {
    async fn list_groups(&self, names: &[String]) -> Result<Vec<LaunchGroup>> {
        let state = self.state.lock();
        Ok(names
            .iter()
            .filter_map(|name| {
                state.groups.get(name).map(|members| LaunchGroup {
                    name: name.clone(),
                    members: members.clone(),
                })
            })
            .collect())
    }

    async fn describe_members(&self, ids: &[MemberId], next_token: Option<&str>) -> Result<MemberPage> {
        let mut state = self.state.lock();
        state.describe_calls += 1;

        let offset = match next_token {
            Some(token) => token.parse::<usize>().map_err(|_| BootstrapError::ServiceError {
                service: "directory".into(),
                code: "InvalidNextToken".into(),
                message: format!("bad token {:?}", token),
                status: 400,
            })?,
            None => 0,
        };

        let known: Vec<MemberStatus> = ids
            .iter()
            .filter_map(|id| {
                state.members.get(id).map(|(lifecycle, address)| MemberStatus {
                    id: id.clone(),
                    lifecycle: lifecycle.clone(),
                    address: *address,
                })
            })
            .collect();

        let end = (offset + self.page_size).min(known.len());
        let members = known.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < known.len()).then(|| end.to_string());

        Ok(MemberPage { members, next_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(raw: &str) -> Option<IpAddr> {
        Some(raw.parse().unwrap())
    }

    #[tokio::test]
    async fn test_pages_through_known_members() {
        let directory = StaticDirectory::new(2);
        for (id, addr) in [("i-1", "10.0.0.1"), ("i-2", "10.0.0.2"), ("i-3", "10.0.0.3")] {
            directory.set_member(id, Lifecycle::Running, ip(addr));
        }
        let ids: Vec<MemberId> = ["i-1", "i-2", "i-3", "i-gone"].into_iter().map(MemberId::from).collect();

        let first = directory.describe_members(&ids, None).await.unwrap();
        assert_eq!(first.members.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = directory.describe_members(&ids, first.next_token.as_deref()).await.unwrap();
        assert_eq!(second.members.len(), 1);
        assert_eq!(second.members[0].id, MemberId::new("i-3"));
        assert!(second.next_token.is_none());
        assert_eq!(directory.describe_calls(), 2);
    }

    #[tokio::test]
    async fn test_remove_member_drops_from_groups() {
        let directory = StaticDirectory::new(10);
        directory.add_group("stack-WorkerASG", &["i-1", "i-2"]);
        directory.set_member("i-1", Lifecycle::Running, ip("10.0.0.1"));
        directory.remove_member("i-1");
        directory.set_health("i-2", MemberHealth::Unhealthy);

        let groups = directory
            .list_groups(&["stack-WorkerASG".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 1);
        assert_eq!(groups[0].members[0].health, MemberHealth::Unhealthy);
    }
}
