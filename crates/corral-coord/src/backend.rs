//! Backend seam between the typed client and a coordination service.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use corral_core::LeaseId;
use corral_state::{CoordStore, Entry, Lease, WatchEvent};

use crate::error::CoordResult;

/// Raw operations a coordination service must provide.
///
/// Values are untyped JSON; [`crate::CoordinationClient`] adds typing,
/// timeouts and the member registration protocol on top.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    async fn get(&self, path: &str) -> CoordResult<Option<Entry>>;

    async fn list(&self, prefix: &str) -> CoordResult<Vec<Entry>>;

    async fn put(
        &self,
        path: &str,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> CoordResult<u64>;

    /// Write only if the key's version equals `expected` (0: absent).
    async fn compare_and_set(
        &self,
        path: &str,
        expected: u64,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> CoordResult<u64>;

    async fn delete(&self, path: &str) -> CoordResult<bool>;

    async fn delete_if_version(&self, path: &str, expected: u64) -> CoordResult<()>;

    async fn grant_lease(&self, ttl: Duration) -> CoordResult<Lease>;

    async fn keep_alive(&self, lease: LeaseId) -> CoordResult<Lease>;

    async fn revoke(&self, lease: LeaseId) -> CoordResult<bool>;

    /// Every change committed after the call.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

#[async_trait]
impl CoordinationBackend for CoordStore {
    async fn get(&self, path: &str) -> CoordResult<Option<Entry>> {
        Ok(CoordStore::get(self, path)?)
    }

    async fn list(&self, prefix: &str) -> CoordResult<Vec<Entry>> {
        Ok(CoordStore::list(self, prefix)?)
    }

    async fn put(
        &self,
        path: &str,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> CoordResult<u64> {
        Ok(CoordStore::put(self, path, value, lease)?)
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: u64,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> CoordResult<u64> {
        Ok(CoordStore::compare_and_set(self, path, expected, value, lease)?)
    }

    async fn delete(&self, path: &str) -> CoordResult<bool> {
        Ok(CoordStore::delete(self, path)?)
    }

    async fn delete_if_version(&self, path: &str, expected: u64) -> CoordResult<()> {
        Ok(CoordStore::delete_if_version(self, path, expected)?)
    }

    async fn grant_lease(&self, ttl: Duration) -> CoordResult<Lease> {
        Ok(CoordStore::grant_lease(self, ttl)?)
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordResult<Lease> {
        Ok(CoordStore::keep_alive(self, lease)?)
    }

    async fn revoke(&self, lease: LeaseId) -> CoordResult<bool> {
        Ok(CoordStore::revoke(self, lease)?)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        CoordStore::subscribe(self)
    }
}
