//! Scaling controller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use corral_coord::{CoordinationClient, Leadership, paths};
use corral_core::{
    ActivePlan, MemberId, MemberState, RoleTag, ServiceInstance, SharedClock, Topology,
};
use corral_placement::RoleAssigner;
use corral_registry::NodeRegistry;

use crate::error::ScalingResult;
use crate::policy::{Breach, ScalingPolicy};
use crate::signals::{LoadFeed, RoleSignals, aggregate};

pub struct ScalingController {
    client: CoordinationClient,
    assigner: Arc<RoleAssigner>,
    registry: Arc<NodeRegistry>,
    policies: BTreeMap<RoleTag, ScalingPolicy>,
    feed: Option<Arc<dyn LoadFeed>>,
    leadership: Leadership,
    clock: SharedClock,
    interval: Duration,
    /// Ongoing breach per role and when it began.
    breaches: Mutex<BTreeMap<RoleTag, (Breach, u64)>>,
    /// Members emptied by scale-in whose Draining mark has not been
    /// written yet. Marked members are found through the registry.
    draining: Mutex<BTreeSet<MemberId>>,
}

impl ScalingController {
    pub fn new(
        client: CoordinationClient,
        assigner: Arc<RoleAssigner>,
        registry: Arc<NodeRegistry>,
        policies: BTreeMap<RoleTag, ScalingPolicy>,
        leadership: Leadership,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            assigner,
            registry,
            policies,
            feed: None,
            leadership,
            clock,
            interval: Duration::from_secs(15),
            breaches: Mutex::new(BTreeMap::new()),
            draining: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_load_feed(mut self, feed: Arc<dyn LoadFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn records(&self) -> ScalingResult<Vec<ServiceInstance>> {
        Ok(self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Current signals for every role with a policy.
    pub async fn signals(&self) -> ScalingResult<BTreeMap<RoleTag, RoleSignals>> {
        let mut all = aggregate(&self.records().await?);
        let mut out = BTreeMap::new();
        for role in self.policies.keys() {
            let mut s = all.remove(role).unwrap_or_default();
            if let Some(feed) = &self.feed {
                s.load = feed.load(role).await;
            }
            out.insert(role.clone(), s);
        }
        Ok(out)
    }

    /// Check every policy; submit a resized topology once a breach has
    /// lasted its window. Returns the topology that was committed.
    pub async fn evaluate(&self) -> ScalingResult<Option<Topology>> {
        if !self.leadership.is_leader() {
            self.breaches.lock().await.clear();
            return Ok(None);
        }
        let Some(current) = self.assigner.active_plan().await? else {
            return Ok(None);
        };
        let current = current.value;
        let signals = self.signals().await?;
        let now = self.clock.now_ms();

        let mut next = current.topology.clone();
        let mut scaled_in = false;
        {
            let mut breaches = self.breaches.lock().await;
            for (role, policy) in &self.policies {
                let Some(target) = current.topology.roles.get(role) else {
                    breaches.remove(role);
                    continue;
                };
                let sig = signals.get(role).cloned().unwrap_or_default();
                let Some(breach) = policy.classify(&sig) else {
                    breaches.remove(role);
                    continue;
                };

                let since = match breaches.get(role) {
                    Some((b, since)) if *b == breach => *since,
                    _ => {
                        breaches.insert(role.clone(), (breach, now));
                        now
                    }
                };
                if now.saturating_sub(since) < policy.window.as_millis() as u64 {
                    debug!(%role, ?breach, "breach within window");
                    continue;
                }
                if breach == Breach::In && !sig.all_ready() {
                    debug!(%role, "scale-in waits for every instance to be Ready");
                    continue;
                }

                let floor = target.constraints.quorum.unwrap_or(0);
                let count = policy.target(target.count, breach, floor);
                if count == target.count {
                    continue;
                }
                info!(%role, from = target.count, to = count, ?breach, "scaling role");
                next = next.with_count(role, count);
                scaled_in |= breach == Breach::In;
                breaches.remove(role);
            }
        }

        if next.roles == current.topology.roles {
            return Ok(None);
        }
        let committed = self.assigner.submit(next).await?;
        if scaled_in {
            self.track_emptied(&current, &committed).await;
        }
        Ok(Some(committed.topology))
    }

    /// Mark members that held roles before and hold none now as
    /// Draining in the registry, so any later leader finds them.
    async fn track_emptied(&self, before: &ActivePlan, after: &ActivePlan) {
        let mut unmarked = self.draining.lock().await;
        for (member, roles) in &before.assignment.members {
            let still = after
                .assignment
                .roles_of(member)
                .is_some_and(|r| !r.is_empty());
            if roles.is_empty() || still {
                continue;
            }
            info!(%member, "member emptied by scale-in, draining");
            if let Err(e) = self.registry.set_state(member, MemberState::Draining).await {
                warn!(%member, error = %e, "failed to mark member draining, will retry");
                unmarked.insert(member.clone());
            }
        }
    }

    /// Release Draining members once no instance records remain on them.
    ///
    /// Candidates come from the registry, so a drain begun by a previous
    /// leader is finished here.
    pub async fn release_drained_members(&self) -> ScalingResult<Vec<MemberId>> {
        if !self.leadership.is_leader() {
            return Ok(Vec::new());
        }
        let plan = self
            .assigner
            .active_plan()
            .await?
            .map(|v| v.value)
            .unwrap_or_default();
        let records = self.records().await?;
        let members = self.registry.list_members().await?;

        {
            let mut unmarked = self.draining.lock().await;
            for id in unmarked.clone() {
                let holds = plan.assignment.roles_of(&id).is_some_and(|r| !r.is_empty());
                let known = members.iter().any(|m| m.id == id);
                if holds || !known {
                    unmarked.remove(&id);
                    continue;
                }
                self.registry.set_state(&id, MemberState::Draining).await?;
                unmarked.remove(&id);
            }
        }

        let mut released = Vec::new();
        for id in self.draining().await {
            if plan.assignment.roles_of(&id).is_some_and(|r| !r.is_empty()) {
                debug!(member = %id, "draining member still holds roles");
                continue;
            }
            let remaining = records.iter().filter(|r| r.member == id).count();
            if remaining > 0 {
                debug!(member = %id, remaining, "member still draining");
                continue;
            }
            self.registry.leave(&id).await?;
            info!(member = %id, "drained member released");
            released.push(id);
        }
        Ok(released)
    }

    /// Members being drained: marked Draining in the registry, or
    /// waiting for that mark to be written.
    pub async fn draining(&self) -> Vec<MemberId> {
        let mut ids: BTreeSet<MemberId> = self.draining.lock().await.clone();
        ids.extend(
            self.registry
                .snapshot()
                .await
                .into_iter()
                .filter(|m| m.state == MemberState::Draining)
                .map(|m| m.id),
        );
        ids.into_iter().collect()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(policies = self.policies.len(), interval = ?self.interval, "scaling controller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.evaluate().await {
                        warn!(error = %e, "scaling evaluation failed");
                    }
                    if let Err(e) = self.release_drained_members().await {
                        warn!(error = %e, "releasing drained members failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }
}
