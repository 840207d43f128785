//! Worker-side rendezvous
//!
//! The instance role gate every node passes first, and the worker wait for
//! the master's membership broadcast.

pub mod gate;
pub mod rendezvous;

pub use gate::{InstanceRoleGate, RoleCredentialSource};
pub use rendezvous::WorkerRendezvous;
