//! Wire messages exchanged over the bootstrap channels
//!
//! Both message kinds are single JSON objects tagged by an `event` field:
//! launch notices (`asg-setup`) on the master queue and the membership
//! broadcast (`worker-setup`) on the worker queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{BootstrapError, Result};

/// Event tag of a launch-group completion notice
pub const LAUNCH_EVENT: &str = "asg-setup";

/// Event tag of the membership broadcast
pub const WORKER_SETUP_EVENT: &str = "worker-setup";

/// Status value that advances the launch ledger
pub const LAUNCH_SUCCESS: &str = "success";

/// Role of a launch group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupRole {
    /// Group holding the single master node
    Master,
    /// Group holding the worker nodes
    Worker,
}

impl GroupRole {
    /// Infer a group's role from its name.
    ///
    /// Groups whose lowercased name contains `master` are master groups;
    /// everything else is a worker group. All call sites go through here.
    pub fn classify(group_name: &str) -> Self {
        if group_name.to_lowercase().contains("master") {
            GroupRole::Master
        } else {
            GroupRole::Worker
        }
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::Master => f.write_str("master"),
            GroupRole::Worker => f.write_str("worker"),
        }
    }
}

/// Outcome reported by the fleet manager for a launch group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Success,
    /// Any status other than success, verbatim
    Failed(String),
}

/// Launch-group completion notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLaunchNotice {
    /// Group identity (the auto scaling group name)
    pub group: String,
    /// Role derived from the group name
    pub role: GroupRole,
    /// Reported outcome
    pub status: LaunchStatus,
    /// Members launched
    pub launched: u32,
    /// Group minimum size
    pub min: Option<u32>,
    /// Group maximum size
    pub max: Option<u32>,
    /// Desired (expected) size
    pub desired: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LaunchNoticeWire {
    event: String,
    status: String,
    asg: String,
    launched: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    desired: Option<u32>,
}

impl GroupLaunchNotice {
    /// Successful launch of `launched` members with a fixed group size
    pub fn success(group: impl Into<String>, launched: u32) -> Self {
        let group = group.into();
        Self {
            role: GroupRole::classify(&group),
            group,
            status: LaunchStatus::Success,
            launched,
            min: Some(launched),
            max: Some(launched),
            desired: Some(launched),
        }
    }

    /// True when the notice reports success
    pub fn is_success(&self) -> bool {
        self.status == LaunchStatus::Success
    }

    /// Serialize in the fleet manager's wire format
    pub fn to_json(&self) -> Result<String> {
        let status = match &self.status {
            LaunchStatus::Success => LAUNCH_SUCCESS.to_string(),
            LaunchStatus::Failed(s) => s.clone(),
        };
        let wire = LaunchNoticeWire {
            event: LAUNCH_EVENT.into(),
            status,
            asg: self.group.clone(),
            launched: self.launched,
            min: self.min,
            max: self.max,
            desired: self.desired,
        };
        serde_json::to_string(&wire).map_err(|e| BootstrapError::Internal {
            message: format!("Failed to encode launch notice: {}", e),
        })
    }

    fn from_wire(wire: LaunchNoticeWire) -> Self {
        let status = if wire.status == LAUNCH_SUCCESS {
            LaunchStatus::Success
        } else {
            LaunchStatus::Failed(wire.status)
        };
        Self {
            role: GroupRole::classify(&wire.asg),
            group: wire.asg,
            status,
            launched: wire.launched,
            min: wire.min,
            max: wire.max,
            desired: wire.desired,
        }
    }
}

/// Agreed cluster membership produced once per episode by the master.
///
/// Addresses are carried as the strings that went over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    master: String,
    workers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerSetupWire {
    event: String,
    #[serde(rename = "master-ip")]
    master_ip: String,
    #[serde(rename = "worker-ips")]
    worker_ips: Vec<String>,
}

impl MembershipView {
    /// Build the view the master broadcasts.
    ///
    /// The master also runs work, so its own address is part of the
    /// worker list. The list is sorted as strings, so `10.0.0.10` comes
    /// before `10.0.0.2`; alias numbering follows this order.
    pub fn with_master_as_worker<I, S>(master: impl Into<String>, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let master = master.into();
        let mut all: Vec<String> = workers.into_iter().map(Into::into).collect();
        all.push(master.clone());
        all.sort();
        Self {
            master,
            workers: all,
        }
    }

    /// Master address
    pub fn master(&self) -> &str {
        &self.master
    }

    /// Worker addresses, master included
    pub fn workers(&self) -> &[String] {
        &self.workers
    }

    /// Serialize as a `worker-setup` broadcast
    pub fn to_json(&self) -> Result<String> {
        let wire = WorkerSetupWire {
            event: WORKER_SETUP_EVENT.into(),
            master_ip: self.master.clone(),
            worker_ips: self.workers.clone(),
        };
        serde_json::to_string(&wire).map_err(|e| BootstrapError::Internal {
            message: format!("Failed to encode worker-setup message: {}", e),
        })
    }

    fn from_wire(wire: WorkerSetupWire) -> Result<Self> {
        if wire.master_ip.is_empty() {
            return Err(BootstrapError::InvalidMessage {
                reason: "empty master-ip".into(),
            });
        }
        Ok(Self {
            master: wire.master_ip,
            workers: wire.worker_ips,
        })
    }
}

/// A decoded channel message
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// `asg-setup` notice
    Launch(GroupLaunchNotice),
    /// `worker-setup` broadcast
    WorkerSetup(MembershipView),
    /// Well-formed message with some other event tag
    Other(String),
}

impl ChannelEvent {
    /// Decode a message body.
    ///
    /// Fails with `InvalidMessage` when the body is not a JSON object with
    /// a string `event`, or a known event is missing fields.
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body).map_err(|e| BootstrapError::InvalidMessage {
            reason: format!("not JSON: {}", e),
        })?;

        let event = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| BootstrapError::InvalidMessage {
                reason: "missing string field 'event'".into(),
            })?
            .to_string();

        match event.as_str() {
            LAUNCH_EVENT => {
                let wire: LaunchNoticeWire = serde_json::from_value(value).map_err(|e| {
                    BootstrapError::InvalidMessage {
                        reason: format!("malformed {} message: {}", LAUNCH_EVENT, e),
                    }
                })?;
                Ok(ChannelEvent::Launch(GroupLaunchNotice::from_wire(wire)))
            }
            WORKER_SETUP_EVENT => {
                let wire: WorkerSetupWire = serde_json::from_value(value).map_err(|e| {
                    BootstrapError::InvalidMessage {
                        reason: format!("malformed {} message: {}", WORKER_SETUP_EVENT, e),
                    }
                })?;
                Ok(ChannelEvent::WorkerSetup(MembershipView::from_wire(wire)?))
            }
            _ => Ok(ChannelEvent::Other(event)),
        }
    }
}
