//! Property: no instance is ever started while one of its dependencies
//! has zero Ready instances on live members, whatever the graph, whichever
//! starts fail and whichever member drops out mid-run.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use corral_coord::{CoordinationClient, Leadership, paths};
use corral_core::{
    ActivePlan, Assignment, ClusterMember, LifecycleState, ManualClock, MemberState, RoleCatalog,
    RoleDefinition, RoleTag, ServiceInstance,
};
use corral_lifecycle::{
    BackoffPolicy, LaunchError, LaunchTarget, LifecycleManager, ServiceLauncher,
};
use corral_state::CoordStore;

/// Checks the dependency rule against the stored records on every start.
struct AuditingLauncher {
    client: CoordinationClient,
    catalog: Arc<RoleCatalog>,
    failures: Vec<bool>,
    calls: AtomicUsize,
    violations: Mutex<Vec<String>>,
    lost: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl ServiceLauncher for AuditingLauncher {
    async fn start(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
        let records = self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await
            .unwrap_or_default();
        let lost = self.lost.lock().unwrap().clone();
        let ready: BTreeSet<RoleTag> = records
            .into_iter()
            .filter(|r| r.value.state == LifecycleState::Ready)
            .filter(|r| !lost.contains(r.value.member.as_str()))
            .map(|r| r.value.role)
            .collect();
        for dep in self.catalog.dependencies(&target.key.role) {
            if !ready.contains(dep) {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("{} started before {dep}", target.key));
            }
        }

        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.get(n).copied().unwrap_or(false) {
            Err(LaunchError::Exited {
                code: Some(1),
                stderr: "injected".into(),
            })
        } else {
            Ok(())
        }
    }

    async fn stop(&self, _target: &LaunchTarget) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// Role `r{i}` may depend on any `r{j}` with `j < i`, so the graph is acyclic.
fn catalog_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..6).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
            .collect::<Vec<_>>()
    })
}

async fn run_case(
    deps: Vec<Vec<usize>>,
    placement: Vec<u8>,
    failures: Vec<bool>,
    loss: Option<(usize, usize)>,
) -> Vec<String> {
    let defs: Vec<RoleDefinition> = deps
        .iter()
        .enumerate()
        .map(|(i, ds)| {
            let names: Vec<String> = ds.iter().map(|d| format!("r{d}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            RoleDefinition::new(&format!("r{i}"), 10, &refs)
        })
        .collect();
    let catalog = Arc::new(RoleCatalog::new(defs).unwrap());

    let clock = ManualClock::new(0);
    let store = CoordStore::open_in_memory()
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let client = CoordinationClient::embedded(store).with_lease_ttl(Duration::from_secs(86_400));

    let mut members = Vec::new();
    for m in 0..3 {
        let mut member = ClusterMember::new(format!("m{m}"), format!("10.0.0.{m}"));
        member.lease = Some(client.register(&member).await.unwrap().id);
        members.push(member);
    }

    let mut assignment = Assignment::default();
    for (i, mask) in placement.iter().enumerate().take(deps.len()) {
        for m in 0..3 {
            if mask & (1 << m) != 0 || m == i % 3 {
                assignment
                    .members
                    .entry(format!("m{m}"))
                    .or_default()
                    .insert(RoleTag::new(format!("r{i}")));
            }
        }
    }
    let plan = ActivePlan {
        assignment,
        ..Default::default()
    };

    let launcher = Arc::new(AuditingLauncher {
        client: client.clone(),
        catalog: catalog.clone(),
        failures,
        calls: AtomicUsize::new(0),
        violations: Mutex::new(Vec::new()),
        lost: Mutex::new(BTreeSet::new()),
    });
    let manager = LifecycleManager::new(
        client.clone(),
        catalog,
        launcher.clone(),
        Arc::new(clock.clone()),
    )
    .with_backoff(BackoffPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(4),
        max_attempts: 3,
    });

    let leader = Leadership::fixed(true);
    for round in 0..12 {
        if let Some((at, m)) = loss {
            if at == round {
                let member = &mut members[m];
                member.state = MemberState::Suspect;
                if let Some(lease) = member.lease.take() {
                    client.release(lease).await.unwrap();
                }
                launcher.lost.lock().unwrap().insert(member.id.clone());
            }
        }
        manager.reconcile(&plan, &members, &leader).await.unwrap();
        clock.advance(Duration::from_secs(5));
    }
    let violations = launcher.violations.lock().unwrap().clone();
    violations
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn starts_never_outrun_dependencies(
        deps in catalog_strategy(),
        placement in proptest::collection::vec(0u8..8, 6),
        failures in proptest::collection::vec(proptest::bool::weighted(0.3), 0..40),
        loss in proptest::option::of((0usize..12, 0usize..3)),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let violations = rt.block_on(run_case(deps, placement, failures, loss));
        prop_assert!(violations.is_empty(), "violations: {:?}", violations);
    }
}
