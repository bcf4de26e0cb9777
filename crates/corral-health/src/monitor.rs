//! Health monitor — the probe loop every controller runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use corral_coord::{CoordError, CoordinationClient, Lease, Leadership, paths};
use corral_core::{ClusterMember, InstanceKey, LifecycleState, ServiceInstance, SharedClock};
use corral_lifecycle::LifecycleManager;

use crate::error::HealthResult;
use crate::probe::{ProbeOutcome, ProbeTable, probe_with_deadline};
use crate::tracker::{HealthReport, HealthTracker, merge_reports};

fn is_probed(state: LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::Starting | LifecycleState::Ready | LifecycleState::Degraded
    )
}

pub struct HealthMonitor {
    client: CoordinationClient,
    probes: ProbeTable,
    lifecycle: Arc<LifecycleManager>,
    leadership: Leadership,
    clock: SharedClock,
    observer: String,
    interval: Duration,
    deadline: Duration,
    freshness: Duration,
    tracker: Mutex<HealthTracker>,
    lease: Mutex<Option<Lease>>,
}

impl HealthMonitor {
    pub fn new(
        client: CoordinationClient,
        probes: ProbeTable,
        lifecycle: Arc<LifecycleManager>,
        leadership: Leadership,
        clock: SharedClock,
        observer: impl Into<String>,
    ) -> Self {
        Self {
            client,
            probes,
            lifecycle,
            leadership,
            clock,
            observer: observer.into(),
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(2),
            freshness: Duration::from_secs(15),
            tracker: Mutex::new(HealthTracker::new(3)),
            lease: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_failure_threshold(self, threshold: u32) -> Self {
        Self {
            tracker: Mutex::new(HealthTracker::new(threshold)),
            ..self
        }
    }

    /// Probe every Starting/Ready/Degraded instance whose role has a
    /// probe and whose host is registered. Probes run concurrently.
    pub async fn poll_once(&self) -> HealthResult<BTreeMap<InstanceKey, ProbeOutcome>> {
        let records = self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await?;
        let addresses: BTreeMap<String, String> = self
            .client
            .list::<ClusterMember>(paths::MEMBERS)
            .await?
            .into_iter()
            .map(|m| (m.value.id, m.value.address))
            .collect();

        let mut set = JoinSet::new();
        for rec in records.into_iter().map(|v| v.value) {
            if !is_probed(rec.state) {
                continue;
            }
            let Some(probe) = self.probes.get(&rec.role) else {
                continue;
            };
            let Some(address) = addresses.get(&rec.member).cloned() else {
                continue;
            };
            let key = rec.key();
            let deadline = self.deadline;
            set.spawn(async move {
                let outcome = probe_with_deadline(probe.as_ref(), &address, deadline).await;
                (key, outcome)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, outcome)) => {
                    if !outcome.is_healthy() {
                        debug!(instance = %key, outcome = ?outcome, "probe missed");
                    }
                    results.insert(key, outcome);
                }
                Err(e) => warn!(error = %e, "probe task panicked"),
            }
        }
        Ok(results)
    }

    /// Write this observer's results under its own lease, dropping
    /// reports for instances it no longer probes.
    pub async fn publish(&self, results: &BTreeMap<InstanceKey, ProbeOutcome>) -> HealthResult<()> {
        let lease = self.observer_lease().await?;
        let now = self.clock.now_ms();
        for (key, outcome) in results {
            let report = HealthReport {
                observer: self.observer.clone(),
                healthy: outcome.is_healthy(),
                observed_at_ms: now,
                detail: outcome.detail(),
            };
            self.client
                .put_ephemeral(&paths::health_report(&self.observer, key), &report, lease.id)
                .await?;
        }

        let prefix = format!("{}{}/", paths::HEALTH, self.observer);
        for old in self.client.list::<HealthReport>(&prefix).await? {
            let stale = paths::health_report_key(&old.path)
                .is_some_and(|(_, key)| !results.contains_key(&key));
            if stale {
                self.client.delete(&old.path).await?;
            }
        }
        Ok(())
    }

    async fn observer_lease(&self) -> HealthResult<Lease> {
        let mut slot = self.lease.lock().await;
        if let Some(lease) = *slot {
            match self.client.heartbeat(&lease).await {
                Ok(renewed) => {
                    *slot = Some(renewed);
                    return Ok(renewed);
                }
                Err(CoordError::LeaseExpired(_)) => {
                    warn!(observer = %self.observer, "observer lease lapsed, granting a new one");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let lease = self.client.grant_lease().await?;
        *slot = Some(lease);
        Ok(lease)
    }

    /// Leader only: merge every observer's reports and apply verdicts.
    /// Returns the instances whose state changed.
    pub async fn evaluate(&self) -> HealthResult<Vec<(InstanceKey, LifecycleState)>> {
        if !self.leadership.is_leader() {
            return Ok(Vec::new());
        }

        let mut reports: BTreeMap<InstanceKey, Vec<HealthReport>> = BTreeMap::new();
        for entry in self.client.list::<HealthReport>(paths::HEALTH).await? {
            if let Some((_, key)) = paths::health_report_key(&entry.path) {
                reports.entry(key).or_default().push(entry.value);
            }
        }

        let records = self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await?;
        let now = self.clock.now_ms();
        let mut tracker = self.tracker.lock().await;
        let mut live = BTreeSet::new();
        let mut changed = Vec::new();

        for rec in records.into_iter().map(|v| v.value) {
            if !is_probed(rec.state) {
                continue;
            }
            let key = rec.key();
            live.insert(key.clone());
            let Some(healthy) = reports
                .get(&key)
                .and_then(|r| merge_reports(r, now, self.freshness))
            else {
                continue;
            };
            tracker.seed(&key, rec.consecutive_misses);
            let Some((verdict, misses)) = tracker.observe(&key, rec.state, healthy) else {
                let misses = tracker.misses(&key);
                if rec.state == LifecycleState::Degraded && misses != rec.consecutive_misses {
                    if let Err(e) = self.lifecycle.record_misses(&key, misses).await {
                        warn!(instance = %key, misses, error = %e, "failed to persist miss count");
                    }
                }
                continue;
            };
            match self.lifecycle.apply_verdict(&key, verdict, misses).await {
                Ok(Some(state)) => changed.push((key, state)),
                Ok(None) => {}
                Err(e) => warn!(instance = %key, ?verdict, error = %e, "failed to apply verdict"),
            }
        }
        tracker.retain(&live);
        Ok(changed)
    }

    /// One probe round: poll, publish, evaluate.
    pub async fn tick(&self) -> HealthResult<Vec<(InstanceKey, LifecycleState)>> {
        let results = self.poll_once().await?;
        self.publish(&results).await?;
        self.evaluate().await
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(observer = %self.observer, interval = ?self.interval, probes = self.probes.len(), "health monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(changed) if !changed.is_empty() => {
                            debug!(changed = changed.len(), "health verdicts applied");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "health round failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
        let lease = *self.lease.lock().await;
        if let Some(lease) = lease {
            let _ = self.client.release(lease.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use corral_core::{ActivePlan, ManualClock, RoleCatalog, RoleTag};
    use corral_lifecycle::NoopLauncher;
    use corral_state::CoordStore;

    use crate::probe::Probe;

    /// A probe whose answer the test flips.
    struct Switch(Arc<AtomicBool>);

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

    struct Fixture {
        monitor: HealthMonitor,
        client: CoordinationClient,
        up: Arc<AtomicBool>,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(1_000);
        let store = CoordStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let client =
            CoordinationClient::embedded(store).with_lease_ttl(Duration::from_secs(3600));
        let catalog = Arc::new(RoleCatalog::standard());
        let lifecycle = Arc::new(LifecycleManager::new(
            client.clone(),
            catalog.clone(),
            Arc::new(NoopLauncher),
            Arc::new(clock.clone()),
        ));

        let mut member = ClusterMember::new("m1", "127.0.0.1");
        member.lease = Some(client.register(&member).await.unwrap().id);
        let mut plan = ActivePlan::default();
        plan.assignment
            .members
            .entry("m1".to_string())
            .or_default()
            .insert(RoleTag::new("metrics-collector"));
        lifecycle
            .reconcile(&plan, &[member], &Leadership::fixed(true))
            .await
            .unwrap();

        let up = Arc::new(AtomicBool::new(true));
        let probes = ProbeTable::from_catalog(&catalog)
            .with_probe("metrics-collector", Arc::new(Switch(up.clone())));
        let monitor = HealthMonitor::new(
            client.clone(),
            probes,
            lifecycle,
            Leadership::fixed(true),
            Arc::new(clock),
            "ctl-1",
        )
        .with_failure_threshold(2);
        Fixture {
            monitor,
            client,
            up,
        }
    }

    async fn state(client: &CoordinationClient) -> LifecycleState {
        client
            .get::<ServiceInstance>("/instances/metrics-collector/m1")
            .await
            .unwrap()
            .unwrap()
            .value
            .state
    }

    #[tokio::test]
    async fn miss_degrades_then_recovers() {
        let fx = fixture().await;
        assert!(fx.monitor.tick().await.unwrap().is_empty());
        assert_eq!(state(&fx.client).await, LifecycleState::Ready);

        fx.up.store(false, Ordering::SeqCst);
        let changed = fx.monitor.tick().await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(state(&fx.client).await, LifecycleState::Degraded);

        fx.up.store(true, Ordering::SeqCst);
        fx.monitor.tick().await.unwrap();
        assert_eq!(state(&fx.client).await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn consecutive_misses_fail_the_instance() {
        let fx = fixture().await;
        fx.up.store(false, Ordering::SeqCst);
        fx.monitor.tick().await.unwrap();
        fx.monitor.tick().await.unwrap();
        assert_eq!(state(&fx.client).await, LifecycleState::Failed);

        // Failed instances are no longer probed, and their reports go away.
        let results = fx.monitor.poll_once().await.unwrap();
        assert!(results.is_empty());
        fx.monitor.publish(&results).await.unwrap();
        assert!(
            fx.client
                .list::<HealthReport>(paths::HEALTH)
                .await
                .unwrap()
                .is_empty()
        );
    }

    async fn misses(client: &CoordinationClient) -> u32 {
        client
            .get::<ServiceInstance>("/instances/metrics-collector/m1")
            .await
            .unwrap()
            .unwrap()
            .value
            .consecutive_misses
    }

    #[tokio::test]
    async fn miss_count_survives_a_leader_change() {
        let fx = fixture().await;
        let monitor = fx.monitor.with_failure_threshold(3);
        fx.up.store(false, Ordering::SeqCst);
        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();
        assert_eq!(state(&fx.client).await, LifecycleState::Degraded);
        assert_eq!(misses(&fx.client).await, 2);

        // The next leader starts with an empty tracker.
        let successor = monitor.with_failure_threshold(3);
        let changed = successor.tick().await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].1, LifecycleState::Failed);
        assert_eq!(misses(&fx.client).await, 3);
    }

    #[tokio::test]
    async fn reports_are_published_per_observer() {
        let fx = fixture().await;
        let results = fx.monitor.poll_once().await.unwrap();
        fx.monitor.publish(&results).await.unwrap();
        let report = fx
            .client
            .get::<HealthReport>("/health/ctl-1/metrics-collector/m1")
            .await
            .unwrap()
            .unwrap();
        assert!(report.value.healthy);
        assert_eq!(report.value.observed_at_ms, 1_000);
    }

    #[tokio::test]
    async fn majority_of_observers_outvotes_a_single_miss() {
        let fx = fixture().await;
        fx.monitor.tick().await.unwrap();
        // Two other observers still see the instance healthy.
        for observer in ["ctl-2", "ctl-3"] {
            let lease = fx.client.grant_lease().await.unwrap();
            let key = InstanceKey::new(RoleTag::new("metrics-collector"), "m1");
            let report = HealthReport {
                observer: observer.into(),
                healthy: true,
                observed_at_ms: 1_000,
                detail: None,
            };
            fx.client
                .put_ephemeral(&paths::health_report(observer, &key), &report, lease.id)
                .await
                .unwrap();
        }
        fx.up.store(false, Ordering::SeqCst);
        assert!(fx.monitor.tick().await.unwrap().is_empty());
        assert_eq!(state(&fx.client).await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn followers_probe_but_do_not_judge() {
        let fx = fixture().await;
        let follower = HealthMonitor {
            leadership: Leadership::fixed(false),
            ..fx.monitor
        };
        fx.up.store(false, Ordering::SeqCst);
        assert!(follower.tick().await.unwrap().is_empty());
        assert_eq!(state(&fx.client).await, LifecycleState::Ready);
    }
}
