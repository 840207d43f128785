//! Master-side coordination
//!
//! Launch-notice watching, membership resolution and the master
//! rendezvous that ties them together.

pub mod launch;
pub mod leader;
pub mod membership;

pub use launch::{GroupLaunchWatcher, LaunchNoticeLedger, MergeOutcome};
pub use leader::MasterCoordinator;
pub use membership::{MembershipResolver, ResolvedMembers};
