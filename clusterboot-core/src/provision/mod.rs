//! Node provisioning once the membership is agreed
//!
//! Both steps sit behind traits so an episode can run against fakes.

pub mod hosts;
pub mod signal;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::MembershipView;

pub use hosts::{FixedGpuCount, GpuInventory, HostFileWriter, NvidiaSmiInventory};
pub use signal::CfnSignal;

/// Applies an agreed membership to the local node
#[async_trait]
pub trait MembershipSink: Send + Sync {
    async fn apply(&self, view: &MembershipView) -> Result<()>;
}

/// Reports successful completion to the stack
#[async_trait]
pub trait CompletionSignal: Send + Sync {
    async fn signal_success(&self) -> Result<()>;
}
