//! End-to-end controller scenarios.
//!
//! Each test assembles a full controller on an in-memory coordination
//! store with a manual clock and drives its passes by hand: reconcile,
//! lease sweeps, health ticks and routing regeneration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::{LifecycleState, PlacementConstraints, RoleTag, Topology};
use corral_health::ProbeTable;
use corral_lifecycle::{LaunchError, LaunchTarget, ServiceLauncher};
use corral_placement::AssignError;

use common::{Switch, cluster, cluster_with_launcher};

/// Starts at once; stops never return.
struct StuckStopLauncher;

#[async_trait]
impl ServiceLauncher for StuckStopLauncher {
    async fn start(&self, _target: &LaunchTarget) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn stop(&self, _target: &LaunchTarget) -> Result<(), LaunchError> {
        std::future::pending().await
    }
}

fn topology(roles: &[(&str, u32)]) -> Topology {
    roles.iter().fold(Topology::default(), |t, (role, count)| {
        t.with_role(role, *count, PlacementConstraints::default())
    })
}

#[tokio::test]
async fn topology_converges_to_ready_in_dependency_order() {
    let fx = cluster(5, ProbeTable::default()).await;
    let plan = fx
        .controller
        .assigner
        .submit(topology(&[
            ("coordination-replica", 3),
            ("load-balancer", 1),
            ("app-runtime", 2),
        ]))
        .await
        .unwrap();

    assert_eq!(plan.assignment.count(&RoleTag::new("coordination-replica")), 3);
    assert_eq!(plan.assignment.count(&RoleTag::new("load-balancer")), 1);
    assert_eq!(plan.assignment.count(&RoleTag::new("app-runtime")), 2);

    let first = fx.controller.reconcile_once().await.unwrap().unwrap();
    assert_eq!(first.created.len(), 6);

    fx.converge().await;
    assert_eq!(fx.ready("coordination-replica").await, 3);
    assert_eq!(fx.ready("load-balancer").await, 1);
    assert_eq!(fx.ready("app-runtime").await, 2);

    // Every instance sits on the member the assignment chose.
    for inst in fx.controller.lifecycle.instances().await.unwrap() {
        assert!(plan.assignment.contains(&inst.member, &inst.role));
    }
}

#[tokio::test]
async fn expired_member_is_replaced_after_grace_window() {
    let mut fx = cluster(5, ProbeTable::default()).await;
    fx.controller
        .assigner
        .submit(topology(&[("coordination-replica", 3), ("app-runtime", 2)]))
        .await
        .unwrap();
    fx.converge().await;
    assert_eq!(fx.ready("app-runtime").await, 2);

    let victim = fx.instances("app-runtime").await[0].member.clone();

    // Everyone but the victim keeps heartbeating.
    fx.clock.advance(Duration::from_secs(6));
    fx.heartbeat_except(&victim).await;
    fx.clock.advance(Duration::from_secs(6));
    assert!(!fx.controller.sweep_leases().is_empty());

    // Within the grace window the member is suspect but keeps its roles.
    fx.controller.registry.resync().await.unwrap();
    let suspect = fx.controller.registry.cached(&victim).await.unwrap();
    assert_eq!(suspect.state, corral_core::MemberState::Suspect);
    let plan = fx.controller.assigner.active_plan().await.unwrap().unwrap();
    assert!(plan.value.assignment.roles_of(&victim).is_some());

    fx.clock.advance(Duration::from_secs(3));
    assert_eq!(fx.controller.registry.sweep_departed().await, vec![victim.clone()]);

    fx.converge().await;
    let app = fx.instances("app-runtime").await;
    assert_eq!(app.len(), 2);
    assert!(app.iter().all(|i| i.state == LifecycleState::Ready));
    assert!(app.iter().all(|i| i.member != victim));

    let plan = fx.controller.assigner.active_plan().await.unwrap().unwrap();
    assert!(plan.value.assignment.roles_of(&victim).is_none());
    assert_eq!(fx.ready("coordination-replica").await, 3);
}

#[tokio::test]
async fn degraded_load_balancer_leaves_routing_until_it_recovers() {
    let lb_probe = Switch::up();
    let probes = ProbeTable::default().with_probe("load-balancer", Arc::new(lb_probe.clone()));
    let fx = cluster(3, probes).await;
    fx.controller
        .assigner
        .submit(topology(&[
            ("coordination-replica", 1),
            ("app-runtime", 1),
            ("load-balancer", 1),
        ]))
        .await
        .unwrap();
    fx.converge().await;

    let lb = RoleTag::new("load-balancer");
    let host = fx.instances("load-balancer").await[0].member.clone();
    let address = fx.controller.registry.cached(&host).await.unwrap().address;
    let server_line = format!("server {host} {address}:80 check");
    fx.controller.routing.regenerate().await.unwrap();
    assert_eq!(
        fx.controller.routing.table().await.unwrap().members_for(&lb),
        vec![host.as_str()]
    );

    // One failed probe.
    lb_probe.set(false);
    let changes = fx.controller.health.tick().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].1, LifecycleState::Degraded);

    let doc = fx.controller.routing.regenerate().await.unwrap().unwrap();
    assert!(!doc.text.contains(&server_line));
    assert!(fx.controller.routing.table().await.unwrap().members_for(&lb).is_empty());

    // Next poll succeeds.
    lb_probe.set(true);
    let changes = fx.controller.health.tick().await.unwrap();
    assert_eq!(changes[0].1, LifecycleState::Ready);

    let doc = fx.controller.routing.regenerate().await.unwrap().unwrap();
    assert!(doc.text.contains(&server_line));
    assert_eq!(fx.sink.applied().len(), 3);
}

#[tokio::test]
async fn infeasible_topology_leaves_assignment_unchanged() {
    let fx = cluster(2, ProbeTable::default()).await;
    fx.controller
        .assigner
        .submit(topology(&[("coordination-replica", 2)]))
        .await
        .unwrap();
    let before = fx.controller.assigner.active_plan().await.unwrap().unwrap();

    let err = fx
        .controller
        .assigner
        .submit(topology(&[("coordination-replica", 3)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AssignError::Infeasible {
            required: 3,
            available: 2,
            ..
        }
    ));

    let after = fx.controller.assigner.active_plan().await.unwrap().unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.value, before.value);
}

#[tokio::test]
async fn followers_leave_instances_alone() {
    let fx = cluster(3, ProbeTable::default()).await;
    fx.controller
        .assigner
        .submit(topology(&[("coordination-replica", 1)]))
        .await
        .unwrap();

    // A second controller on the same store cannot take the lock.
    let mut config = common::test_config();
    config.controller.node_id = "ctl-other".into();
    let follower = corrald::Controller::assemble(
        config,
        fx.controller.store.clone(),
        Arc::new(fx.clock.clone()),
        corrald::Plugins {
            launcher: Arc::new(corral_lifecycle::NoopLauncher),
            sink: Arc::new(corral_proxy::MemorySink::new()),
            probes: ProbeTable::default(),
            broker: Arc::new(corral_queue::MemoryBroker::new(Arc::new(fx.clock.clone()))),
            load_feed: None,
        },
    )
    .unwrap();
    assert!(!follower.campaign().await);
    assert!(follower.reconcile_once().await.unwrap().is_none());
    assert!(fx.instances("coordination-replica").await.is_empty());
}

#[tokio::test]
async fn configured_stop_timeout_bounds_a_hung_stop() {
    let mut config = common::test_config();
    config.lifecycle.stop_timeout = Duration::from_millis(50);
    let fx = cluster_with_launcher(config, 2, ProbeTable::default(), Arc::new(StuckStopLauncher)).await;
    fx.controller
        .assigner
        .submit(topology(&[("metrics-collector", 1)]))
        .await
        .unwrap();
    fx.converge().await;
    assert_eq!(fx.ready("metrics-collector").await, 1);

    fx.controller
        .assigner
        .submit(topology(&[("coordination-replica", 1)]))
        .await
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), fx.controller.reconcile_once())
        .await
        .expect("stop was not bounded by the configured timeout")
        .unwrap()
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].role, RoleTag::new("metrics-collector"));
    let stuck = &fx.instances("metrics-collector").await[0];
    assert_eq!(stuck.state, LifecycleState::Failed);
    assert!(stuck.last_error.is_some());
}
