//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during coordination store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("lease {0} not found or expired")]
    LeaseNotFound(u64),

    #[error("coordination store unavailable")]
    Unavailable,
}
