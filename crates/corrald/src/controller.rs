//! Controller assembly: builds every subsystem from `corral.toml` and
//! runs their loops until shutdown.
//!
//! ```text
//! lease sweeper ── CoordStore::expire_leases
//! leader lock ──── /leader ─► Leadership (gates every writer)
//! registry loop ── /members/ watch ─► RegistryEvent
//! reconcile loop ─ RegistryEvent | /assignment watch | tick
//!                    └─ RoleAssigner::reconcile → LifecycleManager::reconcile
//! health loop ──── probes → /health/ → verdicts (leader)
//! routing loop ─── /roles/ + /members/ watches → proxy config
//! scaling loop ─── signals → RoleAssigner::submit
//! API server ───── axum, /api/v1
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use corral_api::{ApiState, build_router};
use corral_autoscale::{LoadFeed, ScalingController, ScalingPolicy};
use corral_coord::{CoordinationClient, LeaderLock, Leadership, paths};
use corral_core::{
    ClusterMember, ControllerConfig, LeaseId, RoleCatalog, RoleTag, SharedClock, SystemClock,
};
use corral_health::{HealthMonitor, ProbeTable};
use corral_lifecycle::{
    BackoffPolicy, CommandLauncher, LifecycleManager, ReconcileReport, ServiceLauncher,
};
use corral_placement::{AssignError, RoleAssigner};
use corral_proxy::{ConfigGenerator, ConfigSink, FileSink, MemorySink};
use corral_queue::{Broker, MemoryBroker, TaskQueue};
use corral_registry::{MemberAgent, NodeRegistry};
use corral_state::CoordStore;

/// The pieces that touch the outside world.
pub struct Plugins {
    pub launcher: Arc<dyn ServiceLauncher>,
    pub sink: Arc<dyn ConfigSink>,
    pub probes: ProbeTable,
    pub broker: Arc<dyn Broker>,
    pub load_feed: Option<Arc<dyn LoadFeed>>,
}

impl Plugins {
    /// Command launcher, catalog probes, and a file sink when
    /// `routing.output_path` is set (in-memory otherwise).
    pub fn from_config(config: &ControllerConfig, clock: &SharedClock) -> anyhow::Result<Self> {
        let catalog = Arc::new(config.catalog()?);
        let sink: Arc<dyn ConfigSink> = match &config.routing.output_path {
            Some(path) => Arc::new(
                FileSink::new(path)
                    .with_reload_command(config.routing.reload_command.clone())
                    .with_reload_timeout(config.routing.apply_timeout),
            ),
            None => Arc::new(MemorySink::new()),
        };
        Ok(Self {
            launcher: Arc::new(
                CommandLauncher::new(catalog.clone()).with_timeout(config.lifecycle.start_timeout),
            ),
            sink,
            probes: ProbeTable::from_catalog(&catalog),
            broker: Arc::new(MemoryBroker::new(clock.clone())),
            load_feed: None,
        })
    }
}

pub struct Controller {
    pub config: ControllerConfig,
    pub clock: SharedClock,
    pub store: CoordStore,
    pub client: CoordinationClient,
    pub catalog: Arc<RoleCatalog>,
    pub leadership: Leadership,
    pub registry: Arc<NodeRegistry>,
    pub assigner: Arc<RoleAssigner>,
    pub lifecycle: Arc<LifecycleManager>,
    pub health: Arc<HealthMonitor>,
    pub routing: Arc<ConfigGenerator>,
    pub scaling: Arc<ScalingController>,
    pub queue: TaskQueue,
    /// Taken by [`spawn`](Self::spawn); until then [`campaign`](Self::campaign) drives it.
    lock: Mutex<Option<LeaderLock>>,
}

impl Controller {
    /// Wire every subsystem against `store`. Nothing runs until
    /// [`spawn`](Self::spawn).
    pub fn assemble(
        config: ControllerConfig,
        store: CoordStore,
        clock: SharedClock,
        plugins: Plugins,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        let c = &config.controller;

        let client = CoordinationClient::embedded(store.clone())
            .with_timeout(c.coordination_timeout)
            .with_lease_ttl(c.lease_ttl);

        let lock = LeaderLock::new(client.clone(), c.node_id.clone())
            .with_renew_interval(c.heartbeat_interval);
        let leadership = lock.leadership();

        let registry = Arc::new(
            NodeRegistry::new(client.clone(), clock.clone()).with_grace_window(c.grace_window),
        );

        let assigner = Arc::new(
            RoleAssigner::new(
                client.clone(),
                registry.clone(),
                catalog.clone(),
                leadership.clone(),
            )
            .with_max_retries(config.assigner.max_retries),
        );

        let lc = &config.lifecycle;
        let lifecycle = Arc::new(
            LifecycleManager::new(
                client.clone(),
                catalog.clone(),
                plugins.launcher,
                clock.clone(),
            )
            .with_backoff(BackoffPolicy {
                base: lc.backoff_base,
                max: lc.backoff_max,
                max_attempts: lc.max_start_attempts,
            })
            .with_start_timeout(lc.start_timeout)
            .with_stop_timeout(lc.stop_timeout),
        );

        let hc = &config.health;
        let health = Arc::new(
            HealthMonitor::new(
                client.clone(),
                plugins.probes,
                lifecycle.clone(),
                leadership.clone(),
                clock.clone(),
                c.node_id.clone(),
            )
            .with_interval(hc.interval)
            .with_deadline(hc.probe_deadline)
            .with_freshness(hc.report_freshness)
            .with_failure_threshold(hc.failure_threshold),
        );

        let routing = Arc::new(
            ConfigGenerator::new(
                client.clone(),
                catalog.clone(),
                plugins.sink,
                leadership.clone(),
                clock.clone(),
            )
            .with_debounce(config.routing.debounce)
            .with_apply_timeout(config.routing.apply_timeout),
        );

        let policies: BTreeMap<RoleTag, ScalingPolicy> = config
            .scaling
            .policies
            .iter()
            .map(|(role, p)| (role.clone(), ScalingPolicy::from(p)))
            .collect();
        let mut scaling = ScalingController::new(
            client.clone(),
            assigner.clone(),
            registry.clone(),
            policies,
            leadership.clone(),
            clock.clone(),
        )
        .with_interval(config.scaling.interval);
        if let Some(feed) = plugins.load_feed {
            scaling = scaling.with_load_feed(feed);
        }

        let queue = TaskQueue::new(plugins.broker, clock.clone());

        info!(
            node_id = %c.node_id,
            roles = catalog.roles().count(),
            policies = config.scaling.policies.len(),
            "controller assembled"
        );

        Ok(Self {
            config,
            clock,
            store,
            client,
            catalog,
            leadership,
            registry,
            assigner,
            lifecycle,
            health,
            routing,
            scaling: Arc::new(scaling),
            queue,
            lock: Mutex::new(Some(lock)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.controller.node_id
    }

    /// One leader-lock round. Returns whether this controller leads.
    pub async fn campaign(&self) -> bool {
        match self.lock.lock().await.as_mut() {
            Some(lock) => lock.tick().await,
            None => self.leadership.is_leader(),
        }
    }

    /// Expire lapsed leases in the embedded store.
    pub fn sweep_leases(&self) -> Vec<LeaseId> {
        match self.store.expire_leases() {
            Ok(expired) => {
                if !expired.is_empty() {
                    info!(count = expired.len(), leases = ?expired, "leases expired");
                }
                expired
            }
            Err(e) => {
                warn!(error = %e, "lease sweep failed");
                Vec::new()
            }
        }
    }

    /// One reconcile pass: re-plan the active topology against current
    /// membership, then drive instance records toward the plan.
    ///
    /// Followers do nothing and return `None`.
    pub async fn reconcile_once(&self) -> anyhow::Result<Option<ReconcileReport>> {
        if !self.leadership.is_leader() {
            return Ok(None);
        }
        match self.assigner.reconcile().await {
            Ok(Some(plan)) => info!(
                topology = plan.topology.id,
                generation = plan.assignment.generation,
                "assignment re-planned"
            ),
            Ok(None) => {}
            Err(AssignError::Infeasible {
                role,
                required,
                available,
            }) => warn!(
                %role,
                required,
                available,
                "membership cannot satisfy the active topology, keeping current assignment"
            ),
            Err(e) => return Err(e.into()),
        }

        let Some(plan) = self.assigner.active_plan().await? else {
            return Ok(None);
        };
        let members = self.registry.list_members().await?;
        let report = self
            .lifecycle
            .reconcile(&plan.value, &members, &self.leadership)
            .await?;
        Ok(Some(report))
    }

    /// Reconcile on registry changes, plan changes, leadership changes
    /// and every `lifecycle.reconcile_interval`.
    pub async fn reconcile_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.registry.subscribe();
        let mut plan = self.client.watch(paths::ASSIGNMENT);
        let mut leadership = self.leadership.clone();
        let interval = self.config.lifecycle.reconcile_interval;
        info!(interval = ?interval, "reconcile loop started");

        loop {
            match self.reconcile_once().await {
                Ok(Some(report)) if report.changed() => info!(
                    created = report.created.len(),
                    started = report.started.len(),
                    retrying = report.retrying.len(),
                    failed = report.failed.len(),
                    blocked = report.blocked.len(),
                    stopped = report.stopped.len(),
                    deferred = report.deferred.len(),
                    "reconcile pass"
                ),
                Ok(_) => debug!("reconcile pass, nothing to do"),
                Err(e) => warn!(error = %e, "reconcile pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                event = events.recv() => match event {
                    Ok(event) => debug!(?event, "registry change"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "registry events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("registry event stream closed, stopping reconcile loop");
                        return;
                    }
                },
                event = plan.next() => {
                    if event.is_none() {
                        warn!("assignment watch closed, stopping reconcile loop");
                        return;
                    }
                }
                leader = leadership.changed() => info!(leader, "leadership changed"),
                _ = shutdown.changed() => {
                    info!("reconcile loop shutting down");
                    return;
                }
            }
        }
    }

    async fn lease_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = (self.config.controller.lease_ttl / 4).max(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep_leases();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Start every background loop. Each one stops when `shutdown` flips.
    pub async fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.clone().lease_sweeper(shutdown.clone())));
        if let Some(lock) = self.lock.lock().await.take() {
            handles.push(tokio::spawn(lock.run(shutdown.clone())));
        }
        handles.push(tokio::spawn(self.registry.clone().run(shutdown.clone())));

        for seed in &self.config.members {
            let mut member = ClusterMember::new(seed.id.clone(), seed.address.clone());
            member.labels = seed.labels.clone();
            let agent = MemberAgent::new(self.registry.clone(), member)
                .with_interval(self.config.controller.heartbeat_interval);
            handles.push(tokio::spawn(agent.run(shutdown.clone())));
        }
        info!(count = self.config.members.len(), "local member agents started");

        handles.push(tokio::spawn(self.clone().reconcile_loop(shutdown.clone())));
        handles.push(tokio::spawn(self.health.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(self.routing.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(self.scaling.clone().run(shutdown)));
        handles
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            node_id: self.node_id().to_string(),
            leadership: self.leadership.clone(),
            registry: self.registry.clone(),
            assigner: self.assigner.clone(),
            lifecycle: self.lifecycle.clone(),
            routing: self.routing.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        build_router(self.api_state())
    }
}

/// `corrald run`: open the store, start every loop, serve the API until
/// Ctrl-C, then wait for the loops to wind down.
pub async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    info!(node_id = %config.controller.node_id, "corral controller starting");

    std::fs::create_dir_all(&config.controller.data_dir)?;
    let db_path = config.controller.data_dir.join("corral.redb");
    let clock: SharedClock = Arc::new(SystemClock);
    let store = CoordStore::open(&db_path)?.with_clock(clock.clone());
    info!(path = ?db_path, "coordination store opened");

    let plugins = Plugins::from_config(&config, &clock)?;
    let controller = Arc::new(Controller::assemble(config, store, clock, plugins)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = controller.spawn(shutdown_rx).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], controller.config.controller.api_port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, controller.router()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    for handle in handles {
        let _ = handle.await;
    }
    info!("corral controller stopped");
    Ok(())
}

/// `corrald check-config`: validate and summarise the role graph.
pub fn describe(config: &ControllerConfig) -> anyhow::Result<String> {
    config.validate()?;
    let catalog = config.catalog()?;
    let mut roles: Vec<_> = catalog.roles().collect();
    roles.sort_by(|a, b| catalog.start_key(&a.name).cmp(&catalog.start_key(&b.name)));

    let mut out = String::new();
    writeln!(out, "node {} (api port {})", config.controller.node_id, config.controller.api_port)?;
    writeln!(out, "roles in start order:")?;
    for def in roles {
        write!(out, "  {} (priority {})", def.name, def.priority)?;
        if !def.depends_on.is_empty() {
            let deps: Vec<&str> = def.depends_on.iter().map(RoleTag::as_str).collect();
            write!(out, " after {}", deps.join(", "))?;
        }
        if let Some(route) = &def.route {
            write!(
                out,
                " routes :{} -> :{} ({})",
                route.listen_port,
                route.backend_port,
                route.mode.as_str()
            )?;
        }
        writeln!(out)?;
    }
    for (role, policy) in &config.scaling.policies {
        writeln!(out, "scaling {role}: {}..={} step {}", policy.min, policy.max, policy.step)?;
    }
    if !config.members.is_empty() {
        writeln!(out, "local members: {}", config.members.len())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lists_roles_in_start_order() {
        let config = ControllerConfig::default();
        let text = describe(&config).unwrap();
        let pos = |needle: &str| text.find(needle).unwrap();
        assert!(pos("coordination-replica") < pos("app-runtime"));
        assert!(pos("app-runtime (") < pos("load-balancer ("));
        assert!(text.contains("load-balancer (priority 40) after app-runtime routes :80 -> :80 (tcp)"));
    }

    #[test]
    fn describe_rejects_invalid_config() {
        let mut config = ControllerConfig::default();
        config.health.failure_threshold = 0;
        assert!(describe(&config).is_err());
    }
}
