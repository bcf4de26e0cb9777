//! CoordStore — redb-backed coordination namespace.
//!
//! Every mutation runs in a single redb write transaction, so a
//! compare-and-set's version check and its write are atomic. Watch
//! events are published on a broadcast channel after the transaction
//! commits; subscribers filter by path prefix themselves.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use corral_core::{LeaseId, SharedClock, SystemClock};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const WATCH_CAPACITY: usize = 1024;

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct CoordStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
    available: Arc<AtomicBool>,
    clock: SharedClock,
}

impl CoordStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (standalone mode and tests).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    /// Replace the clock used for lease expiry.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn from_db(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
            available: Arc::new(AtomicBool::new(true)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Availability ───────────────────────────────────────────────

    /// Simulate losing (or regaining) the connection to the service.
    ///
    /// While unavailable every call fails with `StateError::Unavailable`;
    /// going unavailable notifies watchers with `WatchEvent::Disconnected`.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            warn!("coordination store marked unavailable");
            let _ = self.events.send(WatchEvent::Disconnected);
        } else if !was && available {
            info!("coordination store available again");
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StateResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StateError::Unavailable)
        }
    }

    /// Subscribe to every change committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    // ── Keys ───────────────────────────────────────────────────────

    /// Get a single key.
    pub fn get(&self, path: &str) -> StateResult<Option<Entry>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        Ok(read_entry(&table, path)?.map(|stored| Entry::from_stored(path, stored)))
    }

    /// List every key starting with `prefix`, in path order.
    pub fn list(&self, prefix: &str) -> StateResult<Vec<Entry>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let stored: StoredEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(Entry::from_stored(key.value(), stored));
            }
        }
        Ok(results)
    }

    /// Unconditionally write a key. Returns the new version.
    pub fn put(
        &self,
        path: &str,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> StateResult<u64> {
        self.check_available()?;
        let now = self.clock.now_ms();
        self.write(|txn, events| write_value(txn, events, path, value, lease, None, now))
    }

    /// Write a key only if its current version equals `expected_version`
    /// (0 means "must not exist"). Returns the new version.
    pub fn compare_and_set(
        &self,
        path: &str,
        expected_version: u64,
        value: serde_json::Value,
        lease: Option<LeaseId>,
    ) -> StateResult<u64> {
        self.check_available()?;
        let now = self.clock.now_ms();
        self.write(|txn, events| {
            write_value(txn, events, path, value, lease, Some(expected_version), now)
        })
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete(&self, path: &str) -> StateResult<bool> {
        self.check_available()?;
        self.write(|txn, events| delete_key(txn, events, path, None))
    }

    /// Delete a key only if its current version equals `expected_version`.
    pub fn delete_if_version(&self, path: &str, expected_version: u64) -> StateResult<()> {
        self.check_available()?;
        self.write(|txn, events| {
            delete_key(txn, events, path, Some(expected_version)).map(|_| ())
        })
    }

    /// Current global revision.
    pub fn revision(&self) -> StateResult<u64> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant a lease that expires `ttl` from now unless kept alive.
    pub fn grant_lease(&self, ttl: Duration) -> StateResult<Lease> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let lease = self.write(|txn, _| {
            let id = bump_counter(txn, LEASE_SEQ_KEY)?;
            let lease = Lease {
                id,
                ttl_ms,
                expires_at_ms: now + ttl_ms,
            };
            write_lease(txn, &lease)?;
            Ok(lease)
        })?;
        debug!(lease = lease.id, ttl_ms, "lease granted");
        Ok(lease)
    }

    /// Extend a live lease by its ttl.
    pub fn keep_alive(&self, id: LeaseId) -> StateResult<Lease> {
        self.check_available()?;
        let now = self.clock.now_ms();
        self.write(|txn, _| {
            let mut lease = live_lease(txn, id, now)?;
            lease.expires_at_ms = now + lease.ttl_ms;
            write_lease(txn, &lease)?;
            Ok(lease)
        })
    }

    /// Look up a lease (expired-but-unswept leases are still returned).
    pub fn lease(&self, id: LeaseId) -> StateResult<Option<Lease>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Revoke a lease and delete every key attached to it.
    pub fn revoke(&self, id: LeaseId) -> StateResult<bool> {
        self.check_available()?;
        let existed = self.write(|txn, events| {
            let existed = {
                let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
                leases.remove(id).map_err(map_err!(Write))?.is_some()
            };
            if existed {
                drop_lease_keys(txn, events, id)?;
            }
            Ok(existed)
        })?;
        if existed {
            info!(lease = id, "lease revoked");
        }
        Ok(existed)
    }

    /// Expire every lease past its deadline, deleting attached keys.
    ///
    /// Returns the ids of the expired leases.
    pub fn expire_leases(&self) -> StateResult<Vec<LeaseId>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let expired = self.write(|txn, events| {
            let expired: Vec<LeaseId> = {
                let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
                let mut ids = Vec::new();
                for entry in leases.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    let lease: Lease =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if lease.expires_at_ms <= now {
                        ids.push(key.value());
                    }
                }
                ids
            };
            for id in &expired {
                {
                    let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
                    leases.remove(*id).map_err(map_err!(Write))?;
                }
                drop_lease_keys(txn, events, *id)?;
            }
            Ok(expired)
        })?;
        for id in &expired {
            info!(lease = id, "lease expired");
        }
        Ok(expired)
    }

    /// Run a write transaction, publishing its events only if it commits.
    fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction, &mut Vec<WatchEvent>) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut events = Vec::new();
        let result = match f(&txn, &mut events) {
            Ok(result) => result,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(result)
    }
}

fn read_entry(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    path: &str,
) -> StateResult<Option<StoredEntry>> {
    match table.get(path).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn bump_counter(txn: &WriteTransaction, key: &str) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(key)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(key, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn write_lease(txn: &WriteTransaction, lease: &Lease) -> StateResult<()> {
    let value = serde_json::to_vec(lease).map_err(map_err!(Serialize))?;
    let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
    leases
        .insert(lease.id, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn live_lease(txn: &WriteTransaction, id: LeaseId, now: u64) -> StateResult<Lease> {
    let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
    let lease: Lease = match leases.get(id).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        None => return Err(StateError::LeaseNotFound(id)),
    };
    if lease.expires_at_ms <= now {
        return Err(StateError::LeaseNotFound(id));
    }
    Ok(lease)
}

fn check_version(path: &str, expected: Option<u64>, actual: u64) -> StateResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StateError::VersionConflict {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn write_value(
    txn: &WriteTransaction,
    events: &mut Vec<WatchEvent>,
    path: &str,
    value: serde_json::Value,
    lease: Option<LeaseId>,
    expected_version: Option<u64>,
    now: u64,
) -> StateResult<u64> {
    if let Some(id) = lease {
        live_lease(txn, id, now)?;
    }

    let actual = {
        let entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        read_entry(&entries, path)?.map(|e| e.version).unwrap_or(0)
    };
    check_version(path, expected_version, actual)?;

    let revision = bump_counter(txn, REVISION_KEY)?;
    let stored = StoredEntry {
        value,
        version: actual + 1,
        lease,
        mod_revision: revision,
    };
    let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
    {
        let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        entries
            .insert(path, bytes.as_slice())
            .map_err(map_err!(Write))?;
    }

    events.push(WatchEvent::Put {
        path: path.to_string(),
        value: stored.value,
        version: stored.version,
        revision,
    });
    Ok(stored.version)
}

fn delete_key(
    txn: &WriteTransaction,
    events: &mut Vec<WatchEvent>,
    path: &str,
    expected_version: Option<u64>,
) -> StateResult<bool> {
    let actual = {
        let entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        read_entry(&entries, path)?.map(|e| e.version).unwrap_or(0)
    };
    check_version(path, expected_version, actual)?;
    if actual == 0 {
        return Ok(false);
    }

    let revision = bump_counter(txn, REVISION_KEY)?;
    {
        let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        entries.remove(path).map_err(map_err!(Write))?;
    }
    events.push(WatchEvent::Delete {
        path: path.to_string(),
        revision,
    });
    Ok(true)
}

fn drop_lease_keys(
    txn: &WriteTransaction,
    events: &mut Vec<WatchEvent>,
    lease: LeaseId,
) -> StateResult<()> {
    let doomed: Vec<String> = {
        let entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut paths = Vec::new();
        for entry in entries.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let stored: StoredEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if stored.lease == Some(lease) {
                paths.push(key.value().to_string());
            }
        }
        paths
    };
    for path in doomed {
        delete_key(txn, events, &path, None)?;
        debug!(%path, lease, "ephemeral key removed with its lease");
    }
    Ok(())
}
