//! Records stored in, and events emitted by, the coordination store.

use serde::{Deserialize, Serialize};

use corral_core::LeaseId;

/// On-disk envelope around a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: serde_json::Value,
    /// 1 on creation, incremented by every write.
    pub version: u64,
    /// Lease the key is attached to; the key dies with it.
    pub lease: Option<LeaseId>,
    /// Global revision of the last modification.
    pub mod_revision: u64,
}

/// A key as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub lease: Option<LeaseId>,
    pub mod_revision: u64,
}

impl Entry {
    pub(crate) fn from_stored(path: &str, stored: StoredEntry) -> Self {
        Self {
            path: path.to_string(),
            value: stored.value,
            version: stored.version,
            lease: stored.lease,
            mod_revision: stored.mod_revision,
        }
    }
}

/// A time-bounded liveness claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl_ms: u64,
    pub expires_at_ms: u64,
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Put {
        path: String,
        value: serde_json::Value,
        version: u64,
        revision: u64,
    },
    Delete {
        path: String,
        revision: u64,
    },
    /// The store became unreachable; every cached view is stale.
    Disconnected,
}

impl WatchEvent {
    /// Path touched by the event, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Put { path, .. } | Self::Delete { path, .. } => Some(path),
            Self::Disconnected => None,
        }
    }
}
