//! CoordinationClient — typed, time-bounded access to coordination state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use corral_core::{ClusterMember, LeaseId};
use corral_state::{CoordStore, Entry, Lease, WatchEvent};

use crate::backend::CoordinationBackend;
use crate::error::{CoordError, CoordResult};
use crate::paths;

/// A decoded document together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub path: String,
    pub value: T,
    pub version: u64,
}

/// Cloneable handle used by every component.
#[derive(Clone)]
pub struct CoordinationClient {
    backend: Arc<dyn CoordinationBackend>,
    timeout: Duration,
    lease_ttl: Duration,
}

impl CoordinationClient {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(2),
            lease_ttl: Duration::from_secs(10),
        }
    }

    /// Client over the embedded store.
    pub fn embedded(store: CoordStore) -> Self {
        Self::new(Arc::new(store))
    }

    /// Bound on every call; exceeding it yields `CoordError::Unavailable`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TTL of leases granted by `register`.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = CoordResult<T>>) -> CoordResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout = ?self.timeout, "coordination call timed out");
                Err(CoordError::Unavailable)
            }
        }
    }

    // ── Documents ──────────────────────────────────────────────────

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> CoordResult<Option<Versioned<T>>> {
        let entry = self.bounded("get", self.backend.get(path)).await?;
        entry.map(decode).transpose()
    }

    /// Every document under `prefix`, in path order.
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> CoordResult<Vec<Versioned<T>>> {
        let entries = self.bounded("list", self.backend.list(prefix)).await?;
        entries.into_iter().map(decode).collect()
    }

    /// Unconditional durable write.
    pub async fn put<T: Serialize>(&self, path: &str, value: &T) -> CoordResult<u64> {
        let value = encode(path, value)?;
        self.bounded("put", self.backend.put(path, value, None)).await
    }

    /// Write a record that disappears with `lease`.
    pub async fn put_ephemeral<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        lease: LeaseId,
    ) -> CoordResult<u64> {
        let value = encode(path, value)?;
        self.bounded("put_ephemeral", self.backend.put(path, value, Some(lease)))
            .await
    }

    /// Versioned write; `expected` 0 means the key must not exist.
    pub async fn compare_and_set<T: Serialize>(
        &self,
        path: &str,
        expected: u64,
        value: &T,
        lease: Option<LeaseId>,
    ) -> CoordResult<u64> {
        let value = encode(path, value)?;
        self.bounded(
            "compare_and_set",
            self.backend.compare_and_set(path, expected, value, lease),
        )
        .await
    }

    pub async fn delete(&self, path: &str) -> CoordResult<bool> {
        self.bounded("delete", self.backend.delete(path)).await
    }

    pub async fn delete_if_version(&self, path: &str, expected: u64) -> CoordResult<()> {
        self.bounded("delete_if_version", self.backend.delete_if_version(path, expected))
            .await
    }

    // ── Leases & registration ──────────────────────────────────────

    /// Grant a fresh lease with the client's ttl.
    pub async fn grant_lease(&self) -> CoordResult<Lease> {
        self.bounded("grant_lease", self.backend.grant_lease(self.lease_ttl))
            .await
    }

    /// Register a member: grant a lease and write its ephemeral record.
    ///
    /// The record at `/members/{id}` is deleted by the coordination
    /// service once heartbeats stop for longer than the lease ttl.
    pub async fn register(&self, member: &ClusterMember) -> CoordResult<Lease> {
        let lease = self.grant_lease().await?;
        let mut record = member.clone();
        record.lease = Some(lease.id);
        if let Err(e) = self
            .put_ephemeral(&paths::member(&member.id), &record, lease.id)
            .await
        {
            // Don't leak the lease of a half-registered member.
            let _ = self.backend.revoke(lease.id).await;
            return Err(e);
        }
        info!(member = %member.id, lease = lease.id, "member registered");
        Ok(lease)
    }

    /// Keep a lease alive. Fails with `LeaseExpired` once it has lapsed.
    pub async fn heartbeat(&self, lease: &Lease) -> CoordResult<Lease> {
        let renewed = self
            .bounded("heartbeat", self.backend.keep_alive(lease.id))
            .await?;
        debug!(lease = lease.id, "lease renewed");
        Ok(renewed)
    }

    /// Give a lease up, deleting every record attached to it.
    pub async fn release(&self, lease: LeaseId) -> CoordResult<bool> {
        self.bounded("release", self.backend.revoke(lease)).await
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Stream of changes under `prefix` committed after this call.
    pub fn watch(&self, prefix: &str) -> WatchStream {
        WatchStream {
            prefix: prefix.to_string(),
            rx: self.backend.subscribe(),
        }
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> CoordResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| CoordError::Codec {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(entry: Entry) -> CoordResult<Versioned<T>> {
    let value = serde_json::from_value(entry.value).map_err(|e| CoordError::Codec {
        path: entry.path.clone(),
        message: e.to_string(),
    })?;
    Ok(Versioned {
        path: entry.path,
        value,
        version: entry.version,
    })
}

/// Prefix-filtered change feed.
///
/// A lagging subscriber has missed events, so lag is reported as
/// `Disconnected`: the consumer must resync from a full read.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    /// Next matching event, or `None` once the backend is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match event.path() {
                    Some(path) if !path.starts_with(&self.prefix) => continue,
                    _ => return Some(event),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(prefix = %self.prefix, missed, "watch lagged, forcing resync");
                    return Some(WatchEvent::Disconnected);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
