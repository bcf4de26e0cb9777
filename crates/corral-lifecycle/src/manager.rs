//! LifecycleManager — drives instance records toward the active plan.
//!
//! `reconcile` is idempotent: it reads every record, works out what
//! the plan and the dependency graph allow, and performs at most one
//! start or stop sequence per instance. A new leader resumes from the
//! records alone.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use corral_coord::{CoordinationClient, Leadership, paths};
use corral_core::{
    ActivePlan, ClusterMember, HealthVerdict, InstanceKey, LifecycleState, MemberState,
    RoleCatalog, RoleTag, ServiceInstance, SharedClock,
};

use crate::backoff::BackoffPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::launcher::{LaunchError, LaunchTarget, ServiceLauncher};
use crate::state_machine::Transition;

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records created (or revived) as Pending.
    pub created: Vec<InstanceKey>,
    /// Instances that started and are now Ready.
    pub started: Vec<InstanceKey>,
    /// Failed starts scheduled for another attempt.
    pub retrying: Vec<InstanceKey>,
    /// Instances that ran out of attempts or failed to stop.
    pub failed: Vec<InstanceKey>,
    /// Pending instances waiting for a dependency to become Ready.
    pub blocked: Vec<InstanceKey>,
    pub stopped: Vec<InstanceKey>,
    /// Stops held back because a serving dependent needs the instance.
    pub deferred: Vec<InstanceKey>,
}

impl ReconcileReport {
    /// Whether any record changed.
    pub fn changed(&self) -> bool {
        !(self.created.is_empty()
            && self.started.is_empty()
            && self.retrying.is_empty()
            && self.failed.is_empty()
            && self.stopped.is_empty())
    }
}

/// A record with the version it was read at.
struct Tracked {
    version: u64,
    inst: ServiceInstance,
}

pub struct LifecycleManager {
    client: CoordinationClient,
    catalog: Arc<RoleCatalog>,
    launcher: Arc<dyn ServiceLauncher>,
    clock: SharedClock,
    backoff: BackoffPolicy,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        client: CoordinationClient,
        catalog: Arc<RoleCatalog>,
        launcher: Arc<dyn ServiceLauncher>,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            catalog,
            launcher,
            clock,
            backoff: BackoffPolicy::default(),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Every instance record, in key order.
    pub async fn instances(&self) -> LifecycleResult<Vec<ServiceInstance>> {
        Ok(self.load().await?.into_values().map(|t| t.inst).collect())
    }

    async fn load(&self) -> LifecycleResult<BTreeMap<InstanceKey, Tracked>> {
        let entries = self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await?;
        Ok(entries
            .into_iter()
            .map(|v| {
                (
                    v.value.key(),
                    Tracked {
                        version: v.version,
                        inst: v.value,
                    },
                )
            })
            .collect())
    }

    async fn load_one(&self, key: &InstanceKey) -> LifecycleResult<Tracked> {
        match self
            .client
            .get::<ServiceInstance>(&paths::instance(key))
            .await?
        {
            Some(v) => Ok(Tracked {
                version: v.version,
                inst: v.value,
            }),
            None => Err(LifecycleError::InstanceNotFound(key.clone())),
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    async fn save(&self, rec: &mut Tracked) -> LifecycleResult<()> {
        let path = paths::instance(&rec.inst.key());
        rec.version = self
            .client
            .compare_and_set(&path, rec.version, &rec.inst, None)
            .await?;
        Ok(())
    }

    async fn step(&self, rec: &mut Tracked, to: LifecycleState) -> LifecycleResult<()> {
        let from = rec.inst.state;
        rec.inst.transition(to, self.clock.now_ms())?;
        self.save(rec).await?;
        debug!(instance = %rec.inst.key(), %from, %to, "transition");
        Ok(())
    }

    /// Publish or withdraw the Ready/Degraded marker of one instance.
    async fn sync_marker(&self, inst: &ServiceInstance) {
        let key = inst.key();
        let path = paths::role_marker(&key);
        let result = if inst.state.is_serving() {
            match self
                .client
                .get::<ClusterMember>(&paths::member(&inst.member))
                .await
            {
                Ok(Some(member)) => match member.value.lease {
                    Some(lease) => self
                        .client
                        .put_ephemeral(&path, &inst.state, lease)
                        .await
                        .map(|_| ()),
                    None => Ok(()),
                },
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.client.delete(&path).await.map(|_| ())
        };
        if let Err(e) = result {
            warn!(instance = %key, error = %e, "failed to update role marker");
        }
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Drive instance records toward `plan`.
    ///
    /// Only the leader may call this; the pass stops with `Cancelled` as
    /// soon as leadership is lost.
    pub async fn reconcile(
        &self,
        plan: &ActivePlan,
        members: &[ClusterMember],
        leadership: &Leadership,
    ) -> LifecycleResult<ReconcileReport> {
        if !leadership.is_leader() {
            return Err(LifecycleError::NotLeader);
        }
        let guard = || {
            if leadership.is_leader() {
                Ok(())
            } else {
                warn!("leadership lost, abandoning reconcile");
                Err(LifecycleError::Cancelled)
            }
        };

        let hosts: BTreeMap<&str, &ClusterMember> = members
            .iter()
            .filter(|m| m.state != MemberState::Suspect && m.lease.is_some())
            .map(|m| (m.id.as_str(), m))
            .collect();
        let desired: BTreeSet<InstanceKey> = plan
            .assignment
            .pairs()
            .map(|(member, role)| InstanceKey::new(role.clone(), member.as_str()))
            .collect();
        let mut records = self.load().await?;
        let mut report = ReconcileReport::default();
        let mut gone = Vec::new();

        // Finish stops a previous pass (or leader) left in flight.
        for (key, rec) in records.iter_mut() {
            if rec.inst.state != LifecycleState::Stopping {
                continue;
            }
            guard()?;
            if self.stop_instance(rec, hosts.get(key.member.as_str()).copied()).await? {
                report.stopped.push(key.clone());
                if !desired.contains(key) {
                    gone.push(key.clone());
                }
            } else {
                report.failed.push(key.clone());
            }
        }
        for key in gone.drain(..) {
            if let Some(rec) = records.remove(&key) {
                self.forget(&key, rec.version).await?;
            }
        }

        // Create or revive desired records.
        let now = self.clock.now_ms();
        for key in &desired {
            match records.get_mut(key) {
                None => {
                    guard()?;
                    let mut rec = Tracked {
                        version: 0,
                        inst: ServiceInstance::new(key.member.clone(), key.role.clone(), now),
                    };
                    self.save(&mut rec).await?;
                    info!(instance = %key, "instance created");
                    records.insert(key.clone(), rec);
                    report.created.push(key.clone());
                }
                Some(rec) if rec.inst.state == LifecycleState::Stopped => {
                    guard()?;
                    rec.inst.attempts = 0;
                    rec.inst.next_attempt_at_ms = 0;
                    rec.inst.last_error = None;
                    self.step(rec, LifecycleState::Pending).await?;
                    report.created.push(key.clone());
                }
                Some(_) => {}
            }
        }

        // Starts whose sequence never completed count as failed attempts.
        let stall_ms = self.start_timeout.as_millis() as u64;
        for key in &desired {
            let Some(rec) = records.get_mut(key) else {
                continue;
            };
            if rec.inst.state == LifecycleState::Starting
                && now >= rec.inst.updated_at_ms + stall_ms
            {
                guard()?;
                let err = LaunchError::Timeout(self.start_timeout).to_string();
                self.record_start_failure(rec, err, &mut report).await?;
            }
        }

        // Starts, in dependency order. Only instances on live hosts count
        // as providers: a Ready record on a lost member is not serving.
        let mut ready = count_by_role(&records, &hosts, |s| s == LifecycleState::Ready);
        let mut pending: Vec<InstanceKey> = desired
            .iter()
            .filter(|k| {
                records
                    .get(*k)
                    .is_some_and(|r| r.inst.state == LifecycleState::Pending)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            self.catalog
                .start_key(&a.role)
                .cmp(&self.catalog.start_key(&b.role))
                .then_with(|| a.member.cmp(&b.member))
        });

        for key in pending {
            let Some(rec) = records.get_mut(&key) else {
                continue;
            };
            if rec.inst.next_attempt_at_ms > self.clock.now_ms() {
                continue;
            }
            let Some(host) = hosts.get(key.member.as_str()) else {
                continue;
            };
            let missing: Vec<&RoleTag> = self
                .catalog
                .dependencies(&key.role)
                .iter()
                .filter(|dep| ready.get(*dep).copied().unwrap_or(0) == 0)
                .collect();
            if !missing.is_empty() {
                debug!(instance = %key, waiting_on = ?missing, "start blocked on dependencies");
                report.blocked.push(key.clone());
                continue;
            }

            guard()?;
            self.start_instance(rec, host, &mut report).await?;
            if rec.inst.state == LifecycleState::Ready {
                *ready.entry(key.role.clone()).or_default() += 1;
            }
        }

        // Stops, in reverse dependency order.
        let mut serving = count_by_role(&records, &hosts, LifecycleState::is_serving);
        let mut doomed: Vec<InstanceKey> = records
            .iter()
            .filter(|(k, r)| !desired.contains(*k) && r.inst.state != LifecycleState::Stopped)
            .map(|(k, _)| k.clone())
            .collect();
        doomed.sort_by_key(|k| {
            (
                Reverse(self.catalog.rank(&k.role)),
                Reverse(self.catalog.priority(&k.role)),
                k.clone(),
            )
        });

        for key in doomed {
            let Some(rec) = records.get_mut(&key) else {
                continue;
            };
            let state = rec.inst.state;
            let live = hosts.contains_key(key.member.as_str());
            if live && state == LifecycleState::Ready {
                let others = ready.get(&key.role).copied().unwrap_or(0).saturating_sub(1);
                let needed = self
                    .catalog
                    .dependents(&key.role)
                    .any(|d| serving.get(d).copied().unwrap_or(0) > 0);
                if others == 0 && needed {
                    info!(instance = %key, "stop deferred: last Ready provider for a serving dependent");
                    report.deferred.push(key.clone());
                    continue;
                }
            }

            guard()?;
            if self.stop_instance(rec, hosts.get(key.member.as_str()).copied()).await? {
                if live && state == LifecycleState::Ready {
                    decrement(&mut ready, &key.role);
                }
                if live && state.is_serving() {
                    decrement(&mut serving, &key.role);
                }
                report.stopped.push(key.clone());
                gone.push(key);
            } else {
                report.failed.push(key);
            }
        }
        for key in gone.drain(..) {
            if let Some(rec) = records.remove(&key) {
                self.forget(&key, rec.version).await?;
            }
        }

        self.sync_markers(&records).await?;

        if report.changed() {
            info!(
                created = report.created.len(),
                started = report.started.len(),
                retrying = report.retrying.len(),
                failed = report.failed.len(),
                stopped = report.stopped.len(),
                blocked = report.blocked.len(),
                deferred = report.deferred.len(),
                "reconcile pass"
            );
        }
        Ok(report)
    }

    async fn start_instance(
        &self,
        rec: &mut Tracked,
        host: &ClusterMember,
        report: &mut ReconcileReport,
    ) -> LifecycleResult<()> {
        let key = rec.inst.key();
        self.step(rec, LifecycleState::Starting).await?;

        let target = LaunchTarget {
            key: key.clone(),
            address: host.address.clone(),
        };
        let outcome = match tokio::time::timeout(self.start_timeout, self.launcher.start(&target))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LaunchError::Timeout(self.start_timeout)),
        };

        match outcome {
            Ok(()) => {
                rec.inst.attempts = 0;
                rec.inst.next_attempt_at_ms = 0;
                rec.inst.consecutive_misses = 0;
                rec.inst.last_error = None;
                self.step(rec, LifecycleState::Ready).await?;
                info!(instance = %key, "instance ready");
                report.started.push(key);
                Ok(())
            }
            Err(e) => self.record_start_failure(rec, e.to_string(), report).await,
        }
    }

    async fn record_start_failure(
        &self,
        rec: &mut Tracked,
        error: String,
        report: &mut ReconcileReport,
    ) -> LifecycleResult<()> {
        let key = rec.inst.key();
        rec.inst.attempts += 1;
        rec.inst.last_error = Some(error.clone());

        if self.backoff.exhausted(rec.inst.attempts) {
            self.step(rec, LifecycleState::Failed).await?;
            error!(instance = %key, attempts = rec.inst.attempts, %error, "instance failed to start, giving up");
            report.failed.push(key);
        } else {
            let delay = self.backoff.delay(rec.inst.attempts);
            rec.inst.next_attempt_at_ms = self.clock.now_ms() + delay.as_millis() as u64;
            self.step(rec, LifecycleState::Pending).await?;
            warn!(instance = %key, attempts = rec.inst.attempts, retry_in = ?delay, %error, "start failed, will retry");
            report.retrying.push(key);
        }
        Ok(())
    }

    /// Take an instance down. Returns false if the stop failed (the
    /// record is then Failed and the stop is retried next pass).
    async fn stop_instance(
        &self,
        rec: &mut Tracked,
        host: Option<&ClusterMember>,
    ) -> LifecycleResult<bool> {
        let key = rec.inst.key();
        if rec.inst.state == LifecycleState::Pending {
            self.step(rec, LifecycleState::Stopped).await?;
            return Ok(true);
        }
        if rec.inst.state != LifecycleState::Stopping {
            self.step(rec, LifecycleState::Stopping).await?;
        }
        self.sync_marker(&rec.inst).await;

        // A host that is gone has nothing left to stop.
        if let Some(host) = host {
            let target = LaunchTarget {
                key: key.clone(),
                address: host.address.clone(),
            };
            let outcome =
                match tokio::time::timeout(self.stop_timeout, self.launcher.stop(&target)).await {
                    Ok(result) => result,
                    Err(_) => Err(LaunchError::Timeout(self.stop_timeout)),
                };
            if let Err(e) = outcome {
                rec.inst.last_error = Some(e.to_string());
                self.step(rec, LifecycleState::Failed).await?;
                error!(instance = %key, error = %e, "instance failed to stop");
                return Ok(false);
            }
        }

        self.step(rec, LifecycleState::Stopped).await?;
        info!(instance = %key, "instance stopped");
        Ok(true)
    }

    /// Delete the record of a stopped instance that is no longer wanted.
    async fn forget(&self, key: &InstanceKey, version: u64) -> LifecycleResult<()> {
        self.client
            .delete_if_version(&paths::instance(key), version)
            .await?;
        Ok(())
    }

    /// Make the Ready/Degraded markers match the records.
    async fn sync_markers(&self, records: &BTreeMap<InstanceKey, Tracked>) -> LifecycleResult<()> {
        let markers: BTreeMap<InstanceKey, LifecycleState> = self
            .client
            .list::<LifecycleState>(paths::ROLES)
            .await?
            .into_iter()
            .filter_map(|m| paths::role_marker_key(&m.path).map(|k| (k, m.value)))
            .collect();

        for (key, rec) in records {
            let want = rec.inst.state.is_serving().then_some(rec.inst.state);
            if markers.get(key).copied() != want {
                self.sync_marker(&rec.inst).await;
            }
        }
        for key in markers.keys().filter(|k| !records.contains_key(*k)) {
            if let Err(e) = self.client.delete(&paths::role_marker(key)).await {
                warn!(instance = %key, error = %e, "failed to remove orphan marker");
            }
        }
        Ok(())
    }

    // ── Health & operator paths ────────────────────────────────────

    /// Apply a health verdict; the only path by which probe results
    /// change instance state. Verdicts that don't fit the current state
    /// are ignored. Returns the new state if one was entered.
    pub async fn apply_verdict(
        &self,
        key: &InstanceKey,
        verdict: HealthVerdict,
        misses: u32,
    ) -> LifecycleResult<Option<LifecycleState>> {
        let mut rec = self.load_one(key).await?;
        let to = match (verdict, rec.inst.state) {
            (HealthVerdict::Promote, LifecycleState::Starting)
            | (HealthVerdict::Recover, LifecycleState::Degraded) => LifecycleState::Ready,
            (HealthVerdict::Degrade, LifecycleState::Ready) => LifecycleState::Degraded,
            (
                HealthVerdict::Fail,
                LifecycleState::Starting | LifecycleState::Ready | LifecycleState::Degraded,
            ) => LifecycleState::Failed,
            _ => return Ok(None),
        };

        rec.inst.consecutive_misses = misses;
        match to {
            LifecycleState::Ready => {
                rec.inst.attempts = 0;
                rec.inst.last_error = None;
            }
            LifecycleState::Failed => {
                rec.inst.last_error = Some(format!("{misses} consecutive probe misses"));
            }
            _ => {}
        }
        self.step(&mut rec, to).await?;
        self.sync_marker(&rec.inst).await;

        match to {
            LifecycleState::Failed => error!(instance = %key, misses, "instance failed health checks"),
            LifecycleState::Degraded => warn!(instance = %key, "instance degraded"),
            _ => info!(instance = %key, state = %to, "instance healthy"),
        }
        Ok(Some(to))
    }

    /// Persist the miss count of a Degraded instance that has not yet
    /// reached the failure threshold.
    pub async fn record_misses(&self, key: &InstanceKey, misses: u32) -> LifecycleResult<()> {
        let mut rec = self.load_one(key).await?;
        if rec.inst.state != LifecycleState::Degraded || rec.inst.consecutive_misses == misses {
            return Ok(());
        }
        rec.inst.consecutive_misses = misses;
        self.save(&mut rec).await?;
        debug!(instance = %key, misses, "miss count recorded");
        Ok(())
    }

    /// Operator reset: Failed → Pending with a fresh attempt budget.
    pub async fn reset(&self, key: &InstanceKey) -> LifecycleResult<ServiceInstance> {
        let mut rec = self.load_one(key).await?;
        rec.inst.attempts = 0;
        rec.inst.next_attempt_at_ms = 0;
        rec.inst.consecutive_misses = 0;
        rec.inst.last_error = None;
        self.step(&mut rec, LifecycleState::Pending).await?;
        info!(instance = %key, "instance reset");
        Ok(rec.inst)
    }
}

/// Instances per role whose state satisfies `pred` and whose host is live.
fn count_by_role(
    records: &BTreeMap<InstanceKey, Tracked>,
    hosts: &BTreeMap<&str, &ClusterMember>,
    pred: impl Fn(LifecycleState) -> bool,
) -> BTreeMap<RoleTag, usize> {
    let mut counts = BTreeMap::new();
    for (key, rec) in records {
        if pred(rec.inst.state) && hosts.contains_key(key.member.as_str()) {
            *counts.entry(key.role.clone()).or_default() += 1;
        }
    }
    counts
}

fn decrement(counts: &mut BTreeMap<RoleTag, usize>, role: &RoleTag) {
    if let Some(n) = counts.get_mut(role) {
        *n = n.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use corral_core::{Assignment, ManualClock, Topology};
    use corral_state::CoordStore;

    use crate::launcher::NoopLauncher;

    /// Launcher that fails the first `failures` starts of chosen roles.
    #[derive(Default)]
    struct ScriptedLauncher {
        failures: Mutex<BTreeMap<RoleTag, u32>>,
        started: Mutex<Vec<InstanceKey>>,
        stopped: Mutex<Vec<InstanceKey>>,
    }

    impl ScriptedLauncher {
        fn failing(role: &str, times: u32) -> Self {
            let launcher = Self::default();
            launcher
                .failures
                .lock()
                .unwrap()
                .insert(RoleTag::new(role), times);
            launcher
        }
    }

    #[async_trait]
    impl ServiceLauncher for ScriptedLauncher {
        async fn start(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&target.key.role) {
                if *left > 0 {
                    *left -= 1;
                    return Err(LaunchError::Exited {
                        code: Some(1),
                        stderr: "boom".into(),
                    });
                }
            }
            self.started.lock().unwrap().push(target.key.clone());
            Ok(())
        }

        async fn stop(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
            self.stopped.lock().unwrap().push(target.key.clone());
            Ok(())
        }
    }

    struct Fixture {
        manager: LifecycleManager,
        client: CoordinationClient,
        clock: ManualClock,
        members: Vec<ClusterMember>,
    }

    async fn fixture(launcher: Arc<dyn ServiceLauncher>) -> Fixture {
        let clock = ManualClock::new(1_000);
        let store = CoordStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let client =
            CoordinationClient::embedded(store).with_lease_ttl(Duration::from_secs(3600));
        let mut members = Vec::new();
        for i in 1..=3 {
            let member = ClusterMember::new(format!("m{i}"), format!("10.0.0.{i}"));
            let lease = client.register(&member).await.unwrap();
            let mut member = member;
            member.lease = Some(lease.id);
            members.push(member);
        }
        let manager = LifecycleManager::new(
            client.clone(),
            Arc::new(RoleCatalog::standard()),
            launcher,
            Arc::new(clock.clone()),
        )
        .with_backoff(BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
            max_attempts: 3,
        });
        Fixture {
            manager,
            client,
            clock,
            members,
        }
    }

    fn plan(pairs: &[(&str, &str)]) -> ActivePlan {
        let mut assignment = Assignment::default();
        for (member, role) in pairs {
            assignment
                .members
                .entry(member.to_string())
                .or_default()
                .insert(RoleTag::new(*role));
        }
        ActivePlan {
            topology: Topology::default(),
            assignment,
        }
    }

    fn key(role: &str, member: &str) -> InstanceKey {
        InstanceKey::new(RoleTag::new(role), member)
    }

    async fn state_of(fx: &Fixture, role: &str, member: &str) -> Option<LifecycleState> {
        fx.client
            .get::<ServiceInstance>(&paths::instance(&key(role, member)))
            .await
            .unwrap()
            .map(|v| v.value.state)
    }

    async fn marker_of(fx: &Fixture, role: &str, member: &str) -> Option<LifecycleState> {
        fx.client
            .get::<LifecycleState>(&paths::role_marker(&key(role, member)))
            .await
            .unwrap()
            .map(|v| v.value)
    }

    #[tokio::test]
    async fn starts_follow_dependency_order() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let fx = fixture(launcher.clone()).await;
        let plan = plan(&[
            ("m1", "load-balancer"),
            ("m2", "app-runtime"),
            ("m3", "coordination-replica"),
        ]);

        let report = fx
            .manager
            .reconcile(&plan, &fx.members, &Leadership::fixed(true))
            .await
            .unwrap();
        assert_eq!(report.created.len(), 3);
        assert_eq!(report.started.len(), 3);
        assert_eq!(
            *launcher.started.lock().unwrap(),
            vec![
                key("coordination-replica", "m3"),
                key("app-runtime", "m2"),
                key("load-balancer", "m1"),
            ]
        );
        assert_eq!(
            state_of(&fx, "load-balancer", "m1").await,
            Some(LifecycleState::Ready)
        );
        assert_eq!(
            marker_of(&fx, "app-runtime", "m2").await,
            Some(LifecycleState::Ready)
        );
    }

    #[tokio::test]
    async fn dependents_wait_for_a_ready_dependency() {
        let launcher = Arc::new(ScriptedLauncher::failing("coordination-replica", 1));
        let fx = fixture(launcher.clone()).await;
        let plan = plan(&[("m1", "coordination-replica"), ("m2", "broker")]);
        let leader = Leadership::fixed(true);

        let report = fx.manager.reconcile(&plan, &fx.members, &leader).await.unwrap();
        assert_eq!(report.retrying, vec![key("coordination-replica", "m1")]);
        assert_eq!(report.blocked, vec![key("broker", "m2")]);
        assert_eq!(
            state_of(&fx, "broker", "m2").await,
            Some(LifecycleState::Pending)
        );

        // Still inside the backoff window: nothing happens.
        let report = fx.manager.reconcile(&plan, &fx.members, &leader).await.unwrap();
        assert!(report.started.is_empty());

        fx.clock.advance(Duration::from_secs(1));
        let report = fx.manager.reconcile(&plan, &fx.members, &leader).await.unwrap();
        assert_eq!(
            report.started,
            vec![key("coordination-replica", "m1"), key("broker", "m2")]
        );
    }

    #[tokio::test]
    async fn start_attempts_are_bounded() {
        let launcher = Arc::new(ScriptedLauncher::failing("metrics-collector", 10));
        let fx = fixture(launcher).await;
        let plan = plan(&[("m1", "metrics-collector")]);
        let leader = Leadership::fixed(true);

        for _ in 0..3 {
            fx.manager.reconcile(&plan, &fx.members, &leader).await.unwrap();
            fx.clock.advance(Duration::from_secs(10));
        }
        let records = fx.manager.instances().await.unwrap();
        assert_eq!(records[0].state, LifecycleState::Failed);
        assert_eq!(records[0].attempts, 3);
        assert!(records[0].last_error.is_some());

        // Failed stays failed until an operator resets it.
        fx.manager.reconcile(&plan, &fx.members, &leader).await.unwrap();
        assert_eq!(
            state_of(&fx, "metrics-collector", "m1").await,
            Some(LifecycleState::Failed)
        );
        let reset = fx
            .manager
            .reset(&key("metrics-collector", "m1"))
            .await
            .unwrap();
        assert_eq!(reset.state, LifecycleState::Pending);
        assert_eq!(reset.attempts, 0);
    }

    #[tokio::test]
    async fn removed_instances_stop_and_records_go_away() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let fx = fixture(launcher.clone()).await;
        let leader = Leadership::fixed(true);
        let full = plan(&[("m1", "coordination-replica"), ("m2", "metrics-collector")]);
        fx.manager.reconcile(&full, &fx.members, &leader).await.unwrap();

        let shrunk = plan(&[("m1", "coordination-replica")]);
        let report = fx.manager.reconcile(&shrunk, &fx.members, &leader).await.unwrap();
        assert_eq!(report.stopped, vec![key("metrics-collector", "m2")]);
        assert_eq!(state_of(&fx, "metrics-collector", "m2").await, None);
        assert_eq!(marker_of(&fx, "metrics-collector", "m2").await, None);
        assert_eq!(
            *launcher.stopped.lock().unwrap(),
            vec![key("metrics-collector", "m2")]
        );
    }

    #[tokio::test]
    async fn last_provider_is_not_stopped_under_a_serving_dependent() {
        let fx = fixture(Arc::new(NoopLauncher)).await;
        let leader = Leadership::fixed(true);
        let full = plan(&[("m1", "coordination-replica"), ("m2", "broker")]);
        fx.manager.reconcile(&full, &fx.members, &leader).await.unwrap();

        // Move the replica from m1 to m3: m3 must be Ready before m1 stops.
        let moved = plan(&[("m3", "coordination-replica"), ("m2", "broker")]);
        let report = fx.manager.reconcile(&moved, &fx.members, &leader).await.unwrap();
        assert!(report.started.contains(&key("coordination-replica", "m3")));
        assert_eq!(report.stopped, vec![key("coordination-replica", "m1")]);

        // Remove every replica while the broker still serves.
        let orphaned = plan(&[("m2", "broker")]);
        let report = fx
            .manager
            .reconcile(&orphaned, &fx.members, &leader)
            .await
            .unwrap();
        assert_eq!(report.deferred, vec![key("coordination-replica", "m3")]);
        assert_eq!(
            state_of(&fx, "coordination-replica", "m3").await,
            Some(LifecycleState::Ready)
        );

        // Once the dependent goes too, stops run dependents first.
        let report = fx
            .manager
            .reconcile(&plan(&[]), &fx.members, &leader)
            .await
            .unwrap();
        assert_eq!(
            report.stopped,
            vec![key("broker", "m2"), key("coordination-replica", "m3")]
        );
    }

    #[tokio::test]
    async fn ready_record_on_a_lost_member_does_not_unblock_dependents() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let mut fx = fixture(launcher.clone()).await;
        let leader = Leadership::fixed(true);
        let replica = plan(&[("m1", "coordination-replica")]);
        fx.manager.reconcile(&replica, &fx.members, &leader).await.unwrap();
        assert_eq!(
            state_of(&fx, "coordination-replica", "m1").await,
            Some(LifecycleState::Ready)
        );

        // m1's lease lapses; its durable record still reads Ready.
        let lease = fx.members[0].lease.take().unwrap();
        fx.client.release(lease).await.unwrap();
        fx.members[0].state = MemberState::Suspect;

        let both = plan(&[("m1", "coordination-replica"), ("m2", "broker")]);
        let report = fx.manager.reconcile(&both, &fx.members, &leader).await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(report.blocked, vec![key("broker", "m2")]);
        assert_eq!(
            state_of(&fx, "broker", "m2").await,
            Some(LifecycleState::Pending)
        );
        assert!(!launcher.started.lock().unwrap().contains(&key("broker", "m2")));
    }

    #[tokio::test]
    async fn stop_on_a_live_host_is_not_deferred_for_a_dead_provider() {
        let fx = fixture(Arc::new(NoopLauncher)).await;
        let leader = Leadership::fixed(true);
        let full = plan(&[
            ("m1", "coordination-replica"),
            ("m3", "coordination-replica"),
            ("m2", "broker"),
        ]);
        fx.manager.reconcile(&full, &fx.members, &leader).await.unwrap();

        // m1 is gone; the replica on m3 is the only live provider and the
        // broker still serves, so removing m3's replica must wait.
        let mut members = fx.members.clone();
        members[0].state = MemberState::Suspect;
        members[0].lease = None;
        let shrunk = plan(&[("m1", "coordination-replica"), ("m2", "broker")]);
        let report = fx.manager.reconcile(&shrunk, &members, &leader).await.unwrap();
        assert_eq!(report.deferred, vec![key("coordination-replica", "m3")]);
        assert_eq!(
            state_of(&fx, "coordination-replica", "m3").await,
            Some(LifecycleState::Ready)
        );
    }

    #[tokio::test]
    async fn verdicts_drive_health_transitions() {
        let fx = fixture(Arc::new(NoopLauncher)).await;
        let leader = Leadership::fixed(true);
        let p = plan(&[("m1", "metrics-collector")]);
        fx.manager.reconcile(&p, &fx.members, &leader).await.unwrap();
        let k = key("metrics-collector", "m1");

        assert_eq!(
            fx.manager.apply_verdict(&k, HealthVerdict::Degrade, 1).await.unwrap(),
            Some(LifecycleState::Degraded)
        );
        assert_eq!(
            marker_of(&fx, "metrics-collector", "m1").await,
            Some(LifecycleState::Degraded)
        );
        // A second degrade on a degraded instance is a no-op.
        assert_eq!(
            fx.manager.apply_verdict(&k, HealthVerdict::Degrade, 2).await.unwrap(),
            None
        );
        assert_eq!(
            fx.manager.apply_verdict(&k, HealthVerdict::Recover, 0).await.unwrap(),
            Some(LifecycleState::Ready)
        );
        assert_eq!(
            fx.manager.apply_verdict(&k, HealthVerdict::Fail, 3).await.unwrap(),
            Some(LifecycleState::Failed)
        );
        assert_eq!(marker_of(&fx, "metrics-collector", "m1").await, None);
    }

    #[tokio::test]
    async fn followers_do_not_reconcile() {
        let fx = fixture(Arc::new(NoopLauncher)).await;
        let p = plan(&[("m1", "metrics-collector")]);
        assert!(matches!(
            fx.manager
                .reconcile(&p, &fx.members, &Leadership::fixed(false))
                .await,
            Err(LifecycleError::NotLeader)
        ));
        assert!(fx.manager.instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_start_is_retried() {
        let fx = fixture(Arc::new(NoopLauncher)).await;
        // A previous leader moved the record to Starting and died.
        let mut inst = ServiceInstance::new("m1", RoleTag::new("metrics-collector"), 1_000);
        inst.state = LifecycleState::Starting;
        fx.client
            .put(&paths::instance(&inst.key()), &inst)
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(31));
        let p = plan(&[("m1", "metrics-collector")]);
        let report = fx
            .manager
            .reconcile(&p, &fx.members, &Leadership::fixed(true))
            .await
            .unwrap();
        assert_eq!(report.retrying, vec![key("metrics-collector", "m1")]);
    }
}
