//! Leader lock — exactly one controller performs authoritative writes.
//!
//! The lock is the ephemeral `/leader` record, created with a
//! create-only compare-and-set under the controller's own lease. The
//! record names both the node and the lease it lives under, and a holder
//! only counts itself leader while the record carries its current lease.
//! The holder keeps its lease alive; if it stops (crash, partition), the
//! record expires and another controller acquires it. The outcome is
//! published on a [`Leadership`] watch that writers check before
//! acting and select on to abandon in-flight work.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use corral_core::LeaseId;
use corral_state::Lease;

use crate::client::CoordinationClient;
use crate::error::{CoordError, CoordResult};
use crate::paths;

/// Contents of `/leader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub node_id: String,
    /// Lease the record is attached to.
    #[serde(default)]
    pub lease: LeaseId,
}

/// Read side of the leader lock.
#[derive(Debug, Clone)]
pub struct Leadership {
    rx: watch::Receiver<bool>,
}

impl Leadership {
    /// A leadership flag that never changes (standalone mode, tests).
    pub fn fixed(leader: bool) -> Self {
        let (_tx, rx) = watch::channel(leader);
        Self { rx }
    }

    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once this controller is not the leader.
    pub async fn lost(&mut self) {
        loop {
            if !*self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone while leading: the flag can no longer change.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves on the next change of the flag.
    pub async fn changed(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }
}

/// Write side: acquires, renews and gives up the `/leader` record.
pub struct LeaderLock {
    client: CoordinationClient,
    node_id: String,
    renew_interval: Duration,
    lease: Option<Lease>,
    tx: watch::Sender<bool>,
}

impl LeaderLock {
    pub fn new(client: CoordinationClient, node_id: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(false);
        let renew_interval = client.lease_ttl() / 3;
        Self {
            client,
            node_id: node_id.into(),
            renew_interval,
            lease: None,
            tx,
        }
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn leadership(&self) -> Leadership {
        Leadership {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    /// One round of the protocol: renew if holding, otherwise try to
    /// acquire. Returns whether this controller leads afterwards.
    pub async fn tick(&mut self) -> bool {
        let leading = match self.lease {
            Some(lease) if self.is_leader() => self.renew(&lease).await,
            _ => self.try_acquire().await,
        };
        self.publish(leading);
        leading
    }

    async fn renew(&mut self, lease: &Lease) -> bool {
        match self.client.heartbeat(lease).await {
            Ok(renewed) => self.lease = Some(renewed),
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "leader lease renewal failed, stepping down");
                self.lease = None;
                return false;
            }
        }
        match self.client.get::<LeaderRecord>(paths::LEADER).await {
            Ok(Some(current)) if self.holds(&current.value, lease.id) => true,
            Ok(current) => {
                warn!(
                    node_id = %self.node_id,
                    holder = ?current.map(|c| c.value.node_id),
                    "leader record no longer ours, stepping down"
                );
                false
            }
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "leader record unreadable, stepping down");
                false
            }
        }
    }

    fn holds(&self, record: &LeaderRecord, lease: LeaseId) -> bool {
        record.node_id == self.node_id && record.lease == lease
    }

    async fn try_acquire(&mut self) -> bool {
        match self.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                debug!(node_id = %self.node_id, error = %e, "leader lock attempt failed");
                false
            }
        }
    }

    async fn acquire(&mut self) -> CoordResult<bool> {
        let lease = match self.lease {
            Some(lease) => self.client.heartbeat(&lease).await?,
            None => self.client.grant_lease().await?,
        };
        self.lease = Some(lease);

        let record = LeaderRecord {
            node_id: self.node_id.clone(),
            lease: lease.id,
        };
        // Version 0 creates the record; a stale record of ours (left by an
        // earlier run under a lease we no longer hold) is moved onto ours.
        let expected = match self.client.get::<LeaderRecord>(paths::LEADER).await? {
            None => 0,
            Some(current) if self.holds(&current.value, lease.id) => return Ok(true),
            Some(current) if current.value.node_id == self.node_id => {
                info!(
                    node_id = %self.node_id,
                    stale_lease = current.value.lease,
                    lease = lease.id,
                    "rebinding leader record to current lease"
                );
                current.version
            }
            Some(_) => return Ok(false),
        };
        match self
            .client
            .compare_and_set(paths::LEADER, expected, &record, Some(lease.id))
            .await
        {
            Ok(_) => Ok(true),
            Err(CoordError::VersionConflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn publish(&self, leading: bool) {
        let was = self.tx.send_replace(leading);
        if was != leading {
            if leading {
                info!(node_id = %self.node_id, "acquired leadership");
            } else {
                warn!(node_id = %self.node_id, "lost leadership");
            }
        }
    }

    /// Give up leadership, releasing the lease (and with it `/leader`).
    pub async fn resign(&mut self) {
        self.publish(false);
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.client.release(lease.id).await {
                warn!(node_id = %self.node_id, error = %e, "failed to release leader lease");
            }
        }
    }

    /// Run the lock until shutdown, then resign.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(node_id = %self.node_id, interval = ?self.renew_interval, "leader lock started");
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                _ = shutdown.changed() => {
                    info!(node_id = %self.node_id, "leader lock shutting down");
                    break;
                }
            }
        }
        self.resign().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ManualClock;
    use corral_state::CoordStore;
    use std::sync::Arc;

    fn store() -> (CoordStore, ManualClock) {
        let clock = ManualClock::new(0);
        let store = CoordStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn lock(store: &CoordStore, node: &str) -> LeaderLock {
        let client = CoordinationClient::embedded(store.clone())
            .with_lease_ttl(Duration::from_secs(10));
        LeaderLock::new(client, node)
    }

    #[tokio::test]
    async fn only_one_controller_leads() {
        let (store, _) = store();
        let mut a = lock(&store, "ctl-a");
        let mut b = lock(&store, "ctl-b");

        assert!(a.tick().await);
        assert!(!b.tick().await);
        assert!(a.tick().await);
        assert!(a.leadership().is_leader());
        assert!(!b.leadership().is_leader());
    }

    #[tokio::test]
    async fn leadership_moves_when_holder_lease_expires() {
        let (store, clock) = store();
        let mut a = lock(&store, "ctl-a");
        let mut b = lock(&store, "ctl-b");
        assert!(a.tick().await);
        assert!(!b.tick().await);

        // ctl-a stops renewing; ctl-b keeps its own lease fresh.
        clock.advance(Duration::from_secs(6));
        assert!(!b.tick().await);
        clock.advance(Duration::from_secs(6));
        store.expire_leases().unwrap();

        assert!(b.tick().await);
        assert!(!a.tick().await);
    }

    #[tokio::test]
    async fn unavailability_steps_down() {
        let (store, _) = store();
        let mut a = lock(&store, "ctl-a");
        let mut leadership = a.leadership();
        assert!(a.tick().await);

        store.set_available(false);
        assert!(!a.tick().await);
        leadership.lost().await;
        assert!(!leadership.is_leader());
    }

    #[tokio::test]
    async fn resign_frees_the_lock() {
        let (store, _) = store();
        let mut a = lock(&store, "ctl-a");
        let mut b = lock(&store, "ctl-b");
        assert!(a.tick().await);
        a.resign().await;
        assert!(b.tick().await);
    }

    #[tokio::test]
    async fn restarted_holder_rebinds_its_record() {
        let (store, clock) = store();
        let mut first = lock(&store, "ctl-a");
        assert!(first.tick().await);
        let old = first.lease.unwrap().id;
        // Crash: the old lease is neither renewed nor released.
        drop(first);

        let mut a = lock(&store, "ctl-a");
        let mut b = lock(&store, "ctl-b");
        assert!(a.tick().await);
        assert!(!b.tick().await);
        let client = CoordinationClient::embedded(store.clone());
        let record = client.get::<LeaderRecord>(paths::LEADER).await.unwrap().unwrap();
        assert_eq!(record.value.lease, a.lease.unwrap().id);
        assert_ne!(record.value.lease, old);

        // The crashed run's lease lapses; the record survives on the new one.
        clock.advance(Duration::from_secs(6));
        assert!(a.tick().await);
        assert!(!b.tick().await);
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.expire_leases().unwrap(), vec![old]);

        assert!(a.tick().await);
        assert!(!b.tick().await);
        let record = client.get::<LeaderRecord>(paths::LEADER).await.unwrap().unwrap();
        assert_eq!(record.value.node_id, "ctl-a");
    }

    #[tokio::test]
    async fn holder_steps_down_when_record_is_taken() {
        let (store, _) = store();
        let mut a = lock(&store, "ctl-a");
        let mut b = lock(&store, "ctl-b");
        let leadership = a.leadership();
        assert!(a.tick().await);

        let client = CoordinationClient::embedded(store.clone());
        assert!(client.delete(paths::LEADER).await.unwrap());
        assert!(b.tick().await);

        // ctl-a's lease is still alive, but the record is not its own.
        assert!(!a.tick().await);
        assert!(!leadership.is_leader());
        assert!(a.lease.is_some());
        assert!(b.tick().await);
    }

    #[test]
    fn fixed_leadership() {
        assert!(Leadership::fixed(true).is_leader());
        assert!(!Leadership::fixed(false).is_leader());
    }
}
