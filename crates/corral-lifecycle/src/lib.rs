//! corral-lifecycle — brings role instances up and down.
//!
//! Every role instance has a persisted [`ServiceInstance`] record at
//! `/instances/{role}/{member}`, owned by the [`LifecycleManager`]. The
//! only legal mutations are the transitions in [`state_machine`]:
//!
//! ```text
//! Pending → Starting → Ready ⇄ Degraded → Stopping → Stopped
//!              │                                ▲
//!              └─ retry (backoff) → Pending      │
//! any → Failed;  Failed → Pending (reset);  Failed → Stopping
//! ```
//!
//! Starts follow the role dependency graph: an instance only begins
//! Starting once each of its dependencies has a Ready instance somewhere
//! in the cluster. Stops run in reverse order and wait while a serving
//! dependent would lose its last Ready provider.
//!
//! [`ServiceInstance`]: corral_core::ServiceInstance

pub mod backoff;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod state_machine;

pub use backoff::BackoffPolicy;
pub use error::{LifecycleError, LifecycleResult};
pub use launcher::{CommandLauncher, LaunchError, LaunchTarget, NoopLauncher, ServiceLauncher};
pub use manager::{LifecycleManager, ReconcileReport};
pub use state_machine::{Transition, can_transition};
