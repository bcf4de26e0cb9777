//! Member agent — the member side of registration.
//!
//! Joins the registry, heartbeats its lease on a fixed interval and
//! reports which roles the member actually runs. If the lease is lost
//! (partition, paused process) the agent re-registers; within the
//! grace window that restores the member with its roles.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use corral_coord::{CoordError, Lease};
use corral_core::{ClusterMember, MemberId, RoleTag};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::NodeRegistry;

/// Reports the roles currently running on a member.
pub type ObservedRolesFn = Arc<dyn Fn(&MemberId) -> BTreeSet<RoleTag> + Send + Sync>;

pub struct MemberAgent {
    registry: Arc<NodeRegistry>,
    member: ClusterMember,
    interval: Duration,
    observed: Option<ObservedRolesFn>,
    lease: Option<Lease>,
}

impl MemberAgent {
    pub fn new(registry: Arc<NodeRegistry>, member: ClusterMember) -> Self {
        Self {
            registry,
            member,
            interval: Duration::from_secs(3),
            observed: None,
            lease: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Source of observed roles. Without one the agent reports the
    /// roles it was assigned.
    pub fn with_observed_roles(mut self, f: ObservedRolesFn) -> Self {
        self.observed = Some(f);
        self
    }

    pub fn member_id(&self) -> &str {
        &self.member.id
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub async fn join(&mut self) -> RegistryResult<()> {
        let lease = self.registry.join(self.member.clone()).await?;
        self.lease = Some(lease);
        Ok(())
    }

    /// One heartbeat; re-registers when the lease has lapsed.
    pub async fn beat(&mut self) -> RegistryResult<()> {
        let Some(lease) = self.lease else {
            return self.join().await;
        };
        let observed = self.observed_roles().await;
        match self
            .registry
            .heartbeat(&lease, &self.member.id, observed)
            .await
        {
            Ok(renewed) => {
                self.lease = Some(renewed);
                Ok(())
            }
            Err(RegistryError::Coord(CoordError::LeaseExpired(_)) | RegistryError::NotFound(_)) => {
                warn!(member = %self.member.id, "lease lost, re-registering");
                self.lease = None;
                self.join().await
            }
            Err(e) => Err(e),
        }
    }

    async fn observed_roles(&self) -> BTreeSet<RoleTag> {
        match &self.observed {
            Some(f) => f(&self.member.id),
            None => self
                .registry
                .cached(&self.member.id)
                .await
                .map(|m| m.declared_roles)
                .unwrap_or_default(),
        }
    }

    /// Leave the cluster, releasing the lease.
    pub async fn leave(&mut self) -> RegistryResult<()> {
        self.lease = None;
        self.registry.leave(&self.member.id).await?;
        Ok(())
    }

    /// Heartbeat until shutdown, then leave.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(member = %self.member.id, interval = ?self.interval, "member agent started");
        loop {
            match self.beat().await {
                Ok(()) => debug!(member = %self.member.id, "heartbeat sent"),
                Err(e) => warn!(member = %self.member.id, error = %e, "heartbeat failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!(member = %self.member.id, "member agent shutting down");
                    break;
                }
            }
        }
        if let Err(e) = self.leave().await {
            warn!(member = %self.member.id, error = %e, "failed to leave cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_coord::CoordinationClient;
    use corral_core::{ManualClock, MemberState};
    use corral_state::CoordStore;

    async fn setup() -> (Arc<NodeRegistry>, CoordStore, ManualClock) {
        let clock = ManualClock::new(0);
        let store = CoordStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let client = CoordinationClient::embedded(store.clone())
            .with_lease_ttl(Duration::from_secs(10));
        let registry = Arc::new(NodeRegistry::new(client, Arc::new(clock.clone())));
        registry.resync().await.unwrap();
        (registry, store, clock)
    }

    #[tokio::test]
    async fn first_beat_joins() {
        let (registry, _, _) = setup().await;
        let mut agent = MemberAgent::new(registry.clone(), ClusterMember::new("m1", "10.0.0.1"));
        assert!(agent.lease().is_none());
        agent.beat().await.unwrap();
        assert!(agent.lease().is_some());
        assert_eq!(registry.get("m1").await.unwrap().state, MemberState::Active);
    }

    #[tokio::test]
    async fn reports_observed_roles_from_callback() {
        let (registry, _, _) = setup().await;
        let observed: ObservedRolesFn = Arc::new(|_| [RoleTag::new("broker")].into());
        let mut agent = MemberAgent::new(registry.clone(), ClusterMember::new("m1", "10.0.0.1"))
            .with_observed_roles(observed);
        agent.beat().await.unwrap();
        agent.beat().await.unwrap();

        let m1 = registry.get("m1").await.unwrap();
        assert!(m1.observed_roles.contains(&RoleTag::new("broker")));
    }

    #[tokio::test]
    async fn rejoins_after_lease_loss() {
        let (registry, store, clock) = setup().await;
        let mut agent = MemberAgent::new(registry.clone(), ClusterMember::new("m1", "10.0.0.1"));
        agent.beat().await.unwrap();
        let first = agent.lease().unwrap().id;

        clock.advance(Duration::from_secs(11));
        store.expire_leases().unwrap();
        agent.beat().await.unwrap();

        assert_ne!(agent.lease().unwrap().id, first);
        let client = CoordinationClient::embedded(store);
        assert!(
            client
                .get::<ClusterMember>("/members/m1")
                .await
                .unwrap()
                .is_some()
        );
    }
}
