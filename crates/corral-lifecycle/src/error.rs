//! Lifecycle error types.

use corral_coord::CoordError;
use corral_core::{InstanceKey, LifecycleState};
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("illegal transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: InstanceKey,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceKey),

    #[error("this controller is not the leader")]
    NotLeader,

    #[error("leadership lost mid-reconcile")]
    Cancelled,

    #[error(transparent)]
    Coord(#[from] CoordError),
}
