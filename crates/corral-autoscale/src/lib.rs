//! corral-autoscale — grows and shrinks role counts.
//!
//! The [`ScalingController`] reads per-role [`RoleSignals`] (how many
//! instances are unhealthy, plus optional external load) and, when a
//! breach of a [`ScalingPolicy`] persists for the policy's window,
//! submits a resized topology through the role assigner. Scale-in only
//! removes Ready instances and never goes below the role's minimum or
//! quorum. Members emptied by scale-in are drained before their lease
//! is released.

pub mod controller;
pub mod error;
pub mod policy;
pub mod signals;

pub use controller::ScalingController;
pub use error::{ScalingError, ScalingResult};
pub use policy::{Breach, ScalingPolicy};
pub use signals::{LoadFeed, RoleSignals, StaticLoadFeed, aggregate};
