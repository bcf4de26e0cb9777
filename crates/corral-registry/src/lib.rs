//! corral-registry — who is in the cluster and what they run.
//!
//! The [`NodeRegistry`] is an in-process cache of `/members/*` kept
//! consistent through a coordination watch. Member records are
//! ephemeral: when a member's lease expires the coordination service
//! deletes its record, the registry keeps the member as `Suspect` for
//! a grace window, and only then reports it removed. A member that
//! re-registers within the window is restored with its roles intact.
//!
//! On watch disconnect the cache is marked stale and reads block until
//! a full resync completes.
//!
//! The [`MemberAgent`] is the member side of the protocol: it joins,
//! heartbeats its lease, and reports which roles it actually runs.

pub mod agent;
pub mod error;
pub mod registry;

pub use agent::{MemberAgent, ObservedRolesFn};
pub use error::{RegistryError, RegistryResult};
pub use registry::{Anomaly, NodeRegistry, RegistryEvent};
