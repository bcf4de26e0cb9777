//! Shared fixture for handler tests.

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;

use corral_coord::{CoordinationClient, Leadership};
use corral_core::{ClusterMember, ManualClock, RoleCatalog};
use corral_lifecycle::{LifecycleManager, NoopLauncher};
use corral_placement::RoleAssigner;
use corral_proxy::{ConfigGenerator, MemorySink};
use corral_queue::{MemoryBroker, TaskQueue};
use corral_registry::NodeRegistry;
use corral_state::CoordStore;

use crate::ApiState;

pub(crate) struct Harness {
    pub state: ApiState,
    pub client: CoordinationClient,
}

/// Three registered members (`m1`..`m3`), a fresh registry and in-memory
/// sinks.
pub(crate) async fn harness(leader: bool) -> Harness {
    let clock = ManualClock::new(1_000);
    let store = CoordStore::open_in_memory()
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let client = CoordinationClient::embedded(store).with_lease_ttl(Duration::from_secs(3600));
    let registry = Arc::new(NodeRegistry::new(client.clone(), Arc::new(clock.clone())));
    for i in 1..=3 {
        registry
            .join(ClusterMember::new(format!("m{i}"), format!("10.0.0.{i}")))
            .await
            .unwrap();
    }
    registry.resync().await.unwrap();

    let catalog = Arc::new(RoleCatalog::standard());
    let leadership = Leadership::fixed(leader);
    let state = ApiState {
        node_id: "ctl-1".into(),
        leadership: leadership.clone(),
        registry: registry.clone(),
        assigner: Arc::new(RoleAssigner::new(
            client.clone(),
            registry,
            catalog.clone(),
            leadership.clone(),
        )),
        lifecycle: Arc::new(LifecycleManager::new(
            client.clone(),
            catalog.clone(),
            Arc::new(NoopLauncher),
            Arc::new(clock.clone()),
        )),
        routing: Arc::new(ConfigGenerator::new(
            client.clone(),
            catalog,
            Arc::new(MemorySink::new()),
            leadership,
            Arc::new(clock.clone()),
        )),
        queue: TaskQueue::new(
            Arc::new(MemoryBroker::new(Arc::new(clock.clone()))),
            Arc::new(clock),
        ),
    };
    Harness { state, client }
}

pub(crate) async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
