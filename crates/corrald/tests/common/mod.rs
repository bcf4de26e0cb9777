//! In-process controller fixture: embedded store on a manual clock,
//! no-op launcher, in-memory routing sink and broker.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use corral_core::{
    ClusterMember, ControllerConfig, LifecycleState, ManualClock, RoleTag, ServiceInstance,
};
use corral_coord::Lease;
use corral_health::{Probe, ProbeOutcome, ProbeTable};
use corral_lifecycle::{NoopLauncher, ServiceLauncher};
use corral_proxy::MemorySink;
use corral_queue::MemoryBroker;
use corral_state::CoordStore;
use corrald::{Controller, Plugins};

pub struct Cluster {
    pub controller: Arc<Controller>,
    pub clock: ManualClock,
    pub sink: Arc<MemorySink>,
    pub leases: BTreeMap<String, Lease>,
}

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.controller.node_id = "ctl-test".into();
    config.controller.lease_ttl = Duration::from_secs(10);
    config.controller.heartbeat_interval = Duration::from_secs(3);
    config.controller.grace_window = Duration::from_secs(2);
    config
}

/// A probe whose result is flipped by the test.
#[derive(Clone)]
pub struct Switch(pub Arc<AtomicBool>);

impl Switch {
    pub fn up() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for Switch {
    async fn probe(&self, _address: &str) -> ProbeOutcome {
        if self.0.load(Ordering::SeqCst) {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Failure("connection refused".into())
        }
    }
}

/// A leading controller with `members` registered (`m1`, `m2`, ...).
pub async fn cluster(members: usize, probes: ProbeTable) -> Cluster {
    cluster_with(test_config(), members, probes).await
}

pub async fn cluster_with(config: ControllerConfig, members: usize, probes: ProbeTable) -> Cluster {
    cluster_with_launcher(config, members, probes, Arc::new(NoopLauncher)).await
}

pub async fn cluster_with_launcher(
    config: ControllerConfig,
    members: usize,
    probes: ProbeTable,
    launcher: Arc<dyn ServiceLauncher>,
) -> Cluster {
    let clock = ManualClock::new(1_000_000);
    let store = CoordStore::open_in_memory()
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let sink = Arc::new(MemorySink::new());
    let plugins = Plugins {
        launcher,
        sink: sink.clone(),
        probes,
        broker: Arc::new(MemoryBroker::new(Arc::new(clock.clone()))),
        load_feed: None,
    };
    let controller =
        Arc::new(Controller::assemble(config, store, Arc::new(clock.clone()), plugins).unwrap());
    assert!(controller.campaign().await, "fresh store must elect us");

    let mut leases = BTreeMap::new();
    for i in 1..=members {
        let id = format!("m{i}");
        let lease = controller
            .registry
            .join(ClusterMember::new(id.clone(), format!("10.0.0.{i}")))
            .await
            .unwrap();
        leases.insert(id, lease);
    }
    controller.registry.resync().await.unwrap();

    Cluster {
        controller,
        clock,
        sink,
        leases,
    }
}

impl Cluster {
    /// Reconcile until a pass changes nothing (bounded).
    pub async fn converge(&self) {
        for _ in 0..8 {
            let report = self.controller.reconcile_once().await.unwrap();
            if !report.is_some_and(|r| r.changed()) {
                return;
            }
        }
        panic!("reconcile did not converge");
    }

    pub async fn instances(&self, role: &str) -> Vec<ServiceInstance> {
        let role = RoleTag::new(role);
        self.controller
            .lifecycle
            .instances()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.role == role)
            .collect()
    }

    pub async fn ready(&self, role: &str) -> usize {
        self.instances(role)
            .await
            .iter()
            .filter(|i| i.state == LifecycleState::Ready)
            .count()
    }

    /// Renew the leases of every member except `skip`, and the leader lock.
    pub async fn heartbeat_except(&mut self, skip: &str) {
        let ids: Vec<String> = self.leases.keys().filter(|id| *id != skip).cloned().collect();
        for id in ids {
            let lease = self.leases[&id];
            let renewed = self
                .controller
                .registry
                .heartbeat(&lease, &id, Default::default())
                .await
                .unwrap();
            self.leases.insert(id, renewed);
        }
        assert!(self.controller.campaign().await);
    }
}
