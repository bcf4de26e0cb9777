//! Error types for coordination calls.

use corral_core::LeaseId;
use corral_state::StateError;
use thiserror::Error;

/// Result type alias for coordination calls.
pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    /// Connection lost or the call timed out. Transient: resync and retry.
    #[error("coordination service unavailable")]
    Unavailable,

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),

    #[error("malformed document at {path}: {message}")]
    Codec { path: String, message: String },

    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordError {
    /// Whether retrying after a resync can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<StateError> for CoordError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Unavailable => Self::Unavailable,
            StateError::VersionConflict {
                path,
                expected,
                actual,
            } => Self::VersionConflict {
                path,
                expected,
                actual,
            },
            StateError::LeaseNotFound(id) => Self::LeaseExpired(id),
            other => Self::Backend(other.to_string()),
        }
    }
}
