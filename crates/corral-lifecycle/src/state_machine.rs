//! Legal lifecycle transitions.

use corral_core::{LifecycleState, ServiceInstance};

use crate::error::{LifecycleError, LifecycleResult};

/// Whether `from → to` is a legal transition.
pub fn can_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    match (from, to) {
        (Failed, Failed) => false,
        (_, Failed) => true,
        (Pending, Starting | Stopped) => true,
        (Starting, Ready | Pending | Stopping) => true,
        (Ready, Degraded | Stopping) => true,
        (Degraded, Ready | Stopping) => true,
        (Stopping, Stopped) => true,
        (Stopped, Pending) => true,
        (Failed, Pending | Stopping) => true,
        _ => false,
    }
}

/// The only mutation path for an instance's state.
pub trait Transition {
    fn transition(&mut self, to: LifecycleState, now_ms: u64) -> LifecycleResult<()>;
}

impl Transition for ServiceInstance {
    fn transition(&mut self, to: LifecycleState, now_ms: u64) -> LifecycleResult<()> {
        if !can_transition(self.state, to) {
            return Err(LifecycleError::IllegalTransition {
                key: self.key(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at_ms = now_ms;
        Ok(())
    }
}
