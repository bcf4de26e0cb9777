//! NodeRegistry — watch-invalidated cache of cluster members.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use corral_coord::{CoordError, CoordinationClient, Lease, WatchEvent, paths};
use corral_core::{ClusterMember, MemberId, MemberState, RoleTag, SharedClock};

use crate::error::{RegistryError, RegistryResult};

/// Attempts at a read-modify-write of one member record.
const UPDATE_RETRIES: usize = 5;

/// Membership changes, fanned out to the other control loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A new member registered, or a suspect member re-registered.
    MemberJoined(MemberId),
    /// Roles, state, address or labels of a member changed.
    Changed(MemberId),
    /// The member's lease expired; the grace window is running.
    MemberSuspect(MemberId),
    /// The member left or its grace window elapsed.
    MemberRemoved(MemberId),
    /// The cache lost its watch; reads block until the next resync.
    Stale,
    Resynced,
}

/// Roles a member reports running without having been assigned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub member: MemberId,
    pub roles: Vec<RoleTag>,
}

pub struct NodeRegistry {
    client: CoordinationClient,
    clock: SharedClock,
    grace_window: Duration,
    resync_timeout: Duration,
    sweep_interval: Duration,
    members: RwLock<BTreeMap<MemberId, ClusterMember>>,
    /// `true` while the cache reflects the coordination service.
    fresh: watch::Sender<bool>,
    events: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    /// New registry; stale until the first [`resync`](Self::resync).
    pub fn new(client: CoordinationClient, clock: SharedClock) -> Self {
        let (fresh, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            client,
            clock,
            grace_window: Duration::from_secs(30),
            resync_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            members: RwLock::new(BTreeMap::new()),
            fresh,
            events,
        }
    }

    /// How long a member whose lease expired may re-register and keep its roles.
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    /// Longest a read waits for a pending resync before failing with `Stale`.
    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn is_stale(&self) -> bool {
        !*self.fresh.borrow()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    // ── Member side ────────────────────────────────────────────────

    /// Register a member and start its lease.
    ///
    /// A member re-registering within its grace window keeps the roles
    /// it was assigned.
    pub async fn join(&self, member: ClusterMember) -> RegistryResult<Lease> {
        let mut record = member;
        record.last_heartbeat_ms = self.clock.now_ms();
        record.departed_at_ms = None;
        record.state = MemberState::Active;
        if let Some(prev) = self.members.read().await.get(&record.id) {
            if record.declared_roles.is_empty() {
                record.declared_roles = prev.declared_roles.clone();
            }
            if prev.state == MemberState::Draining {
                record.state = MemberState::Draining;
            }
        }

        let lease = self.client.register(&record).await?;
        record.lease = Some(lease.id);
        info!(member = %record.id, address = %record.address, lease = lease.id, "member joined");
        self.upsert(record).await;
        Ok(lease)
    }

    /// Renew a member's lease and record the roles it reports running.
    pub async fn heartbeat(
        &self,
        lease: &Lease,
        id: &str,
        observed_roles: BTreeSet<RoleTag>,
    ) -> RegistryResult<Lease> {
        let renewed = self.client.heartbeat(lease).await?;
        let now = self.clock.now_ms();
        let record = self
            .update_record(id, |m| {
                m.last_heartbeat_ms = now;
                m.observed_roles = observed_roles.clone();
            })
            .await?;

        let undeclared = record.undeclared_roles();
        if !undeclared.is_empty() {
            warn!(member = %id, roles = ?undeclared, "member runs roles it was never assigned");
        }
        debug!(member = %id, "heartbeat received");
        Ok(renewed)
    }

    /// Graceful departure: the member is removed without a grace window.
    pub async fn leave(&self, id: &str) -> RegistryResult<bool> {
        let removed = self.members.write().await.remove(id);
        let lease = match removed.as_ref().and_then(|m| m.lease) {
            Some(lease) => Some(lease),
            None => self
                .client
                .get::<ClusterMember>(&paths::member(id))
                .await?
                .and_then(|v| v.value.lease),
        };
        match lease {
            Some(lease) => {
                self.client.release(lease).await?;
            }
            None => {
                self.client.delete(&paths::member(id)).await?;
            }
        }

        if removed.is_some() {
            info!(member = %id, "member left");
            self.emit(RegistryEvent::MemberRemoved(id.to_string()));
        }
        Ok(removed.is_some())
    }

    // ── Controller side ────────────────────────────────────────────

    /// Record the roles the controller assigned to a member.
    pub async fn declare_roles(&self, id: &str, roles: BTreeSet<RoleTag>) -> RegistryResult<()> {
        match self
            .update_record(id, |m| m.declared_roles = roles.clone())
            .await
        {
            Ok(_) => Ok(()),
            // Suspect members have no record; their roles live on in the cache.
            Err(RegistryError::NotFound(_)) => {
                let mut members = self.members.write().await;
                match members.get_mut(id) {
                    Some(member) => {
                        member.declared_roles = roles;
                        Ok(())
                    }
                    None => Err(RegistryError::NotFound(id.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Change a member's registry state (e.g. `Draining` for scale-in).
    pub async fn set_state(&self, id: &str, state: MemberState) -> RegistryResult<()> {
        self.update_record(id, |m| m.state = state).await?;
        info!(member = %id, ?state, "member state changed");
        Ok(())
    }

    /// Read-modify-write of `/members/{id}` with compare-and-set.
    async fn update_record(
        &self,
        id: &str,
        mut f: impl FnMut(&mut ClusterMember),
    ) -> RegistryResult<ClusterMember> {
        let path = paths::member(id);
        for _ in 0..UPDATE_RETRIES {
            let Some(current) = self.client.get::<ClusterMember>(&path).await? else {
                return Err(RegistryError::NotFound(id.to_string()));
            };
            let mut record = current.value.clone();
            f(&mut record);
            if record == current.value {
                return Ok(record);
            }
            match self
                .client
                .compare_and_set(&path, current.version, &record, record.lease)
                .await
            {
                Ok(_) => {
                    self.upsert(record.clone()).await;
                    return Ok(record);
                }
                Err(CoordError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RegistryError::Conflict(id.to_string()))
    }

    // ── Cache maintenance ──────────────────────────────────────────

    async fn upsert(&self, record: ClusterMember) {
        let id = record.id.clone();
        let event = {
            let mut members = self.members.write().await;
            match members.insert(id.clone(), record.clone()) {
                None => Some(RegistryEvent::MemberJoined(id.clone())),
                Some(prev) if prev.state == MemberState::Suspect => {
                    info!(member = %id, "member re-registered within grace window");
                    Some(RegistryEvent::MemberJoined(id.clone()))
                }
                Some(prev) if !same_material(&prev, &record) => {
                    Some(RegistryEvent::Changed(id.clone()))
                }
                Some(_) => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn mark_departed(&self, id: &str) {
        let now = self.clock.now_ms();
        let suspect = {
            let mut members = self.members.write().await;
            match members.get_mut(id) {
                Some(member) if member.state != MemberState::Suspect => {
                    member.state = MemberState::Suspect;
                    member.departed_at_ms = Some(now);
                    member.lease = None;
                    true
                }
                _ => false,
            }
        };
        if suspect {
            warn!(member = %id, grace = ?self.grace_window, "member lease expired, grace window started");
            self.emit(RegistryEvent::MemberSuspect(id.to_string()));
        }
    }

    fn mark_stale(&self) {
        if self.fresh.send_replace(false) {
            warn!("member cache marked stale");
            self.emit(RegistryEvent::Stale);
        }
    }

    /// Apply one change from the `/members/` watch.
    pub async fn apply_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put { path, value, .. } => {
                let Some(id) = paths::member_id(&path) else {
                    return;
                };
                match serde_json::from_value::<ClusterMember>(value) {
                    Ok(record) if record.id == id => self.upsert(record).await,
                    Ok(record) => {
                        warn!(%path, record_id = %record.id, "member record id does not match its path")
                    }
                    Err(e) => warn!(%path, error = %e, "ignoring malformed member record"),
                }
            }
            WatchEvent::Delete { path, .. } => {
                if let Some(id) = paths::member_id(&path) {
                    self.mark_departed(id).await;
                }
            }
            WatchEvent::Disconnected => self.mark_stale(),
        }
    }

    /// Rebuild the cache from a full read of `/members/`.
    ///
    /// Cached members with no record become `Suspect`; the cache is
    /// fresh again afterwards.
    pub async fn resync(&self) -> RegistryResult<usize> {
        let records = self.client.list::<ClusterMember>(paths::MEMBERS).await?;
        let now = self.clock.now_ms();
        let mut events = Vec::new();

        let count = {
            let mut members = self.members.write().await;
            let live: BTreeMap<MemberId, ClusterMember> = records
                .into_iter()
                .map(|v| (v.value.id.clone(), v.value))
                .collect();

            for (id, cached) in members.iter_mut() {
                if !live.contains_key(id) && cached.state != MemberState::Suspect {
                    cached.state = MemberState::Suspect;
                    cached.departed_at_ms = Some(now);
                    cached.lease = None;
                    events.push(RegistryEvent::MemberSuspect(id.clone()));
                }
            }
            for (id, record) in live {
                match members.insert(id.clone(), record.clone()) {
                    None => events.push(RegistryEvent::MemberJoined(id)),
                    Some(prev) if prev.state == MemberState::Suspect => {
                        events.push(RegistryEvent::MemberJoined(id))
                    }
                    Some(prev) if !same_material(&prev, &record) => {
                        events.push(RegistryEvent::Changed(id))
                    }
                    Some(_) => {}
                }
            }
            members.len()
        };

        self.fresh.send_replace(true);
        for event in events {
            self.emit(event);
        }
        self.emit(RegistryEvent::Resynced);
        info!(members = count, "member cache resynced");
        Ok(count)
    }

    /// Drop suspect members whose grace window has elapsed.
    pub async fn sweep_departed(&self) -> Vec<MemberId> {
        let now = self.clock.now_ms();
        let grace_ms = self.grace_window.as_millis() as u64;
        let removed: Vec<MemberId> = {
            let mut members = self.members.write().await;
            let expired: Vec<MemberId> = members
                .values()
                .filter(|m| {
                    m.state == MemberState::Suspect
                        && m
                            .departed_at_ms
                            .is_some_and(|t| now.saturating_sub(t) >= grace_ms)
                })
                .map(|m| m.id.clone())
                .collect();
            for id in &expired {
                members.remove(id);
            }
            expired
        };
        for id in &removed {
            info!(member = %id, "member removed after grace window");
            self.emit(RegistryEvent::MemberRemoved(id.clone()));
        }
        removed
    }

    // ── Reads ──────────────────────────────────────────────────────

    async fn wait_fresh(&self) -> RegistryResult<()> {
        let mut rx = self.fresh.subscribe();
        match tokio::time::timeout(self.resync_timeout, rx.wait_for(|fresh| *fresh)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(RegistryError::Stale),
        }
    }

    /// All members, suspect ones included. Blocks while the cache is stale.
    pub async fn list_members(&self) -> RegistryResult<Vec<ClusterMember>> {
        self.wait_fresh().await?;
        Ok(self.snapshot().await)
    }

    /// Members currently holding a lease.
    pub async fn live_members(&self) -> RegistryResult<Vec<ClusterMember>> {
        Ok(self
            .list_members()
            .await?
            .into_iter()
            .filter(|m| m.state != MemberState::Suspect)
            .collect())
    }

    pub async fn get(&self, id: &str) -> RegistryResult<ClusterMember> {
        self.wait_fresh().await?;
        self.cached(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Current cache contents without waiting for a resync.
    pub async fn snapshot(&self) -> Vec<ClusterMember> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn cached(&self, id: &str) -> Option<ClusterMember> {
        self.members.read().await.get(id).cloned()
    }

    /// Observed-but-undeclared roles, per member.
    pub async fn anomalies(&self) -> Vec<Anomaly> {
        self.members
            .read()
            .await
            .values()
            .filter_map(|m| {
                let roles = m.undeclared_roles();
                (!roles.is_empty()).then(|| Anomaly {
                    member: m.id.clone(),
                    roles,
                })
            })
            .collect()
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Keep the cache in sync until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut watch = self.client.watch(paths::MEMBERS);
        if !self.resync_with_backoff(&mut shutdown).await {
            return;
        }

        let mut sweep = tokio::time::interval(self.sweep_interval);
        info!(grace = ?self.grace_window, "registry loop started");
        loop {
            tokio::select! {
                event = watch.next() => match event {
                    Some(WatchEvent::Disconnected) => {
                        self.mark_stale();
                        if !self.resync_with_backoff(&mut shutdown).await {
                            break;
                        }
                    }
                    Some(event) => self.apply_event(event).await,
                    None => {
                        warn!("member watch closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_departed().await;
                }
                _ = shutdown.changed() => {
                    info!("registry loop shutting down");
                    break;
                }
            }
        }
    }

    /// Retry `resync` with exponential backoff. Returns false on shutdown.
    async fn resync_with_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut delay = Duration::from_millis(100);
        loop {
            match self.resync().await {
                Ok(_) => return true,
                Err(e) => warn!(error = %e, retry_in = ?delay, "member resync failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }
}

/// Equality ignoring heartbeat timestamps.
fn same_material(a: &ClusterMember, b: &ClusterMember) -> bool {
    a.address == b.address
        && a.labels == b.labels
        && a.declared_roles == b.declared_roles
        && a.observed_roles == b.observed_roles
        && a.state == b.state
        && a.lease == b.lease
}
