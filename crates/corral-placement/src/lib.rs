//! corral-placement — decides which member runs which role.
//!
//! This crate computes placements; it does not start anything (that's
//! `corral-lifecycle`). The pure planner turns the active assignment,
//! a member snapshot and a topology into a new assignment, or reports
//! the topology infeasible. The [`RoleAssigner`] commits results to
//! `/assignment` with compare-and-set, recomputing on conflict.
//!
//! # Components
//!
//! - **`planner`**: `compute_assignment` and `validate_topology`
//! - **`assigner`**: leader-gated submission and re-planning

pub mod assigner;
pub mod error;
pub mod planner;

pub use assigner::RoleAssigner;
pub use error::{AssignError, AssignResult};
pub use planner::{compute_assignment, validate_topology};
