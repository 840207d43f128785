//! Clusterboot Core - one-shot cluster membership rendezvous
//!
//! This crate lets a freshly launched cluster agree on its membership:
//! - Waiting for the launch groups to report success
//! - Resolving group members to running addresses
//! - Broadcasting the membership from the master to every worker
//! - Provisioning host aliases and signalling completion

pub mod aws;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fleet;
pub mod protocol;
pub mod provision;
pub mod runtime;
pub mod worker;

pub use config::{BootstrapConfig, NodeRole};
pub use error::{BootstrapError, Result};
pub use protocol::MembershipView;
pub use runtime::{BootstrapEpisode, DeadlineBudget, EpisodeServices};

/// Default sleep between unproductive polls in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default visibility window for launch notices in seconds
pub const DEFAULT_LAUNCH_VISIBILITY_SECS: u64 = 60;
