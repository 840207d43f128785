//! Fleet directory abstraction
//!
//! Two read APIs over eventually-consistent fleet state: the members of
//! named launch groups, and the lifecycle state and address of members.

pub mod aws;
pub mod memory;
pub mod xml;

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

use crate::error::Result;

pub use aws::AwsFleetDirectory;
pub use memory::StaticDirectory;

/// Opaque member (instance) id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Health reported by the group for one member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberHealth {
    Healthy,
    Unhealthy,
}

impl MemberHealth {
    /// Anything but `Healthy` counts as unhealthy
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("healthy") {
            MemberHealth::Healthy
        } else {
            MemberHealth::Unhealthy
        }
    }
}

/// Member as listed by its launch group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub id: MemberId,
    pub health: MemberHealth,
}

/// A launch group and its current members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchGroup {
    pub name: String,
    pub members: Vec<GroupMember>,
}

/// Lifecycle state of a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Running,
    /// Any other state, lowercased
    Other(String),
}

impl Lifecycle {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Lifecycle::Pending,
            "running" => Lifecycle::Running,
            other => Lifecycle::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Pending => f.write_str("pending"),
            Lifecycle::Running => f.write_str("running"),
            Lifecycle::Other(state) => f.write_str(state),
        }
    }
}

/// Lifecycle state and address of one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub id: MemberId,
    pub lifecycle: Lifecycle,
    /// Private network address, once assigned
    pub address: Option<IpAddr>,
}

/// One page of member statuses
#[derive(Debug, Clone, Default)]
pub struct MemberPage {
    pub members: Vec<MemberStatus>,
    /// Token for the next page, if any
    pub next_token: Option<String>,
}

/// Read access to fleet state
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    /// Current members of the named groups; unknown names are omitted
    async fn list_groups(&self, names: &[String]) -> Result<Vec<LaunchGroup>>;

    /// Lifecycle state and address for `ids`, one page at a time
    async fn describe_members(&self, ids: &[MemberId], next_token: Option<&str>) -> Result<MemberPage>;
}
