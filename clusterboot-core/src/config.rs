//! Bootstrap configuration
//!
//! Loaded once from the environment, validated, and passed by reference to
//! every component. Nothing reads the environment after this point.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::aws::{HttpConfig, MetadataConfig};
use crate::error::{BootstrapError, Result};
use crate::protocol::GroupRole;

/// Largest batch a single receive may ask for
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Role this node plays in the rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    /// Parse `master` / `worker`, case-insensitively
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            _ => Err(BootstrapError::UnknownRole {
                role: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

/// Polling cadence shared by every waiting phase
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep between unproductive attempts
    pub interval: Duration,
    /// Messages requested per receive
    pub batch_size: u32,
    /// Visibility window for launch notices on the master queue
    pub launch_visibility: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            batch_size: MAX_RECEIVE_BATCH,
            launch_visibility: Duration::from_secs(crate::DEFAULT_LAUNCH_VISIBILITY_SECS),
        }
    }
}

/// Files written once the membership is known
#[derive(Debug, Clone)]
pub struct ProvisionPaths {
    /// Host alias file, appended to
    pub hosts_file: PathBuf,
    /// Worker alias list, rewritten
    pub workers_file: PathBuf,
    /// Login profile script, appended to
    pub profile_script: PathBuf,
}

impl Default for ProvisionPaths {
    fn default() -> Self {
        Self {
            hosts_file: PathBuf::from("/etc/hosts"),
            workers_file: PathBuf::from("/opt/deeplearning/workers"),
            profile_script: PathBuf::from("/etc/profile.d/deeplearning.sh"),
        }
    }
}

/// Endpoint overrides; `None` means the regional default
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub sqs: Option<String>,
    pub ec2: Option<String>,
    pub autoscaling: Option<String>,
    pub metadata: Option<String>,
}

/// Immutable configuration of one bootstrap episode
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Role of this node
    pub role: NodeRole,
    /// Queue carrying launch notices
    pub master_queue: String,
    /// Queue carrying the membership broadcast
    pub worker_queue: String,
    /// Total wait-condition timeout of the stack
    pub wait_condition_timeout: Duration,
    /// Time reserved for the master launch, subtracted from the total
    pub master_launch_timeout: Duration,
    /// Stack the completion signal is sent to
    pub stack_id: String,
    /// Wait handle URL of the completion signal
    pub wait_handle: String,
    /// Instance role whose credentials gate the bootstrap
    pub role_name: String,
    /// OS user owning the provisioned worker list
    pub default_user: String,
    /// AWS region
    pub region: String,
    /// Shared storage mount point exported to the profile
    pub efs_mount: PathBuf,
    /// Directory holding the `cfn-signal` tool
    pub cfn_path: PathBuf,
    /// Group roles that must report a successful launch
    pub expected_roles: BTreeSet<GroupRole>,
    /// Polling cadence
    pub poll: PollSettings,
    /// Provisioned file locations
    pub paths: ProvisionPaths,
    /// Service endpoint overrides
    pub endpoints: Endpoints,
    /// Per-request HTTP timeouts
    pub http: HttpConfig,
    /// Directory for the log file; console only when unset
    pub log_dir: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup` and validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| BootstrapError::MissingConfig { key: key.to_string() })
        };

        let mut poll = PollSettings::default();
        if let Some(v) = lookup("CLUSTERBOOT_POLL_INTERVAL_SECS") {
            poll.interval = parse_seconds("CLUSTERBOOT_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("CLUSTERBOOT_RECEIVE_BATCH") {
            poll.batch_size = parse_number("CLUSTERBOOT_RECEIVE_BATCH", &v)?;
        }
        if let Some(v) = lookup("CLUSTERBOOT_LAUNCH_VISIBILITY_SECS") {
            poll.launch_visibility = parse_seconds("CLUSTERBOOT_LAUNCH_VISIBILITY_SECS", &v)?;
        }

        let mut http = HttpConfig::default();
        if let Some(v) = lookup("CLUSTERBOOT_HTTP_TIMEOUT_SECS") {
            http.request_timeout = parse_seconds("CLUSTERBOOT_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CLUSTERBOOT_CONNECT_TIMEOUT_SECS") {
            http.connect_timeout = parse_seconds("CLUSTERBOOT_CONNECT_TIMEOUT_SECS", &v)?;
        }

        let mut paths = ProvisionPaths::default();
        if let Some(v) = lookup("CLUSTERBOOT_HOSTS_FILE") {
            paths.hosts_file = v.into();
        }
        if let Some(v) = lookup("CLUSTERBOOT_WORKERS_FILE") {
            paths.workers_file = v.into();
        }
        if let Some(v) = lookup("CLUSTERBOOT_PROFILE_SCRIPT") {
            paths.profile_script = v.into();
        }

        let endpoints = Endpoints {
            sqs: lookup("CLUSTERBOOT_SQS_ENDPOINT"),
            ec2: lookup("CLUSTERBOOT_EC2_ENDPOINT"),
            autoscaling: lookup("CLUSTERBOOT_AUTOSCALING_ENDPOINT"),
            metadata: lookup("CLUSTERBOOT_METADATA_ENDPOINT"),
        };

        let config = Self {
            role: NodeRole::parse(&required("AWS_DL_NODE_TYPE")?)?,
            master_queue: required("AWS_DL_MASTER_QUEUE")?,
            worker_queue: required("AWS_DL_WORKER_QUEUE")?,
            wait_condition_timeout: parse_seconds(
                "AWS_DL_WAITCONDITION_TIMEOUT",
                &required("AWS_DL_WAITCONDITION_TIMEOUT")?,
            )?,
            master_launch_timeout: parse_seconds(
                "AWS_DL_MASTERLAUNCH_TIMEOUT",
                &required("AWS_DL_MASTERLAUNCH_TIMEOUT")?,
            )?,
            stack_id: required("AWS_DL_STACK_ID")?,
            wait_handle: required("AWS_DL_WAIT_HANDLE")?,
            role_name: required("AWS_DL_ROLE_NAME")?,
            default_user: required("AWS_DL_DEFAULT_USER")?,
            region: required("AWS_REGION")?,
            efs_mount: required("EFS_MOUNT")?.into(),
            cfn_path: required("CFN_PATH")?.into(),
            expected_roles: [GroupRole::Master, GroupRole::Worker].into_iter().collect(),
            poll,
            paths,
            endpoints,
            http,
            log_dir: lookup("CLUSTERBOOT_LOG_DIR").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("AWS_DL_MASTER_QUEUE", &self.master_queue),
            ("AWS_DL_WORKER_QUEUE", &self.worker_queue),
            ("AWS_DL_STACK_ID", &self.stack_id),
            ("AWS_DL_WAIT_HANDLE", &self.wait_handle),
            ("AWS_DL_ROLE_NAME", &self.role_name),
            ("AWS_DL_DEFAULT_USER", &self.default_user),
            ("AWS_REGION", &self.region),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }

        if self.wait_condition_timeout.is_zero() {
            return Err(invalid("AWS_DL_WAITCONDITION_TIMEOUT", "must be positive"));
        }
        if self.master_launch_timeout > self.wait_condition_timeout {
            return Err(invalid(
                "AWS_DL_MASTERLAUNCH_TIMEOUT",
                "must not exceed AWS_DL_WAITCONDITION_TIMEOUT",
            ));
        }
        if self.poll.batch_size == 0 || self.poll.batch_size > MAX_RECEIVE_BATCH {
            return Err(invalid("CLUSTERBOOT_RECEIVE_BATCH", "must be between 1 and 10"));
        }
        if self.poll.interval.is_zero() {
            return Err(invalid("CLUSTERBOOT_POLL_INTERVAL_SECS", "must be positive"));
        }
        if self.expected_roles.is_empty() {
            return Err(invalid("expected_roles", "must name at least one group role"));
        }

        Ok(())
    }

    /// Time the whole episode may take
    pub fn available_budget(&self) -> Duration {
        self.wait_condition_timeout
            .saturating_sub(self.master_launch_timeout)
    }

    /// Instance metadata client settings
    pub fn metadata(&self) -> MetadataConfig {
        let mut metadata = MetadataConfig::default();
        if let Some(endpoint) = &self.endpoints.metadata {
            metadata.endpoint = endpoint.clone();
        }
        metadata
    }
}

fn invalid(key: &str, reason: &str) -> BootstrapError {
    BootstrapError::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Seconds as a non-negative float
fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("{:?} is not a number of seconds", raw)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(key, &format!("{:?} is not a valid duration", raw)))
}

fn parse_number(key: &str, raw: &str) -> Result<u32> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, &format!("{:?} is not a whole number", raw)))
}
