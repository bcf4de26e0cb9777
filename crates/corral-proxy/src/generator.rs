//! Config generator — rebuilds the proxy config when routing changes.
//!
//! Regeneration is triggered by changes under `/roles/` (Ready and
//! Degraded markers) and `/members/` (addresses), coalesced over a
//! debounce window, with a periodic resync as a safety net.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use corral_coord::{CoordError, CoordinationClient, Leadership, WatchEvent, paths};
use corral_core::{ClusterMember, RoleCatalog, ServiceInstance, SharedClock};

use crate::error::{RoutingError, RoutingResult};
use crate::render::{ConfigDocument, render, validate};
use crate::sink::ConfigSink;
use crate::table::RoutingTable;

/// Contents of `/routing`: what the leader last applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub digest: String,
    pub table: RoutingTable,
    pub applied_at_ms: u64,
}

pub struct ConfigGenerator {
    client: CoordinationClient,
    catalog: Arc<RoleCatalog>,
    sink: Arc<dyn ConfigSink>,
    leadership: Leadership,
    clock: SharedClock,
    debounce: Duration,
    apply_timeout: Duration,
    resync_interval: Duration,
    last_applied: Mutex<Option<String>>,
}

impl ConfigGenerator {
    pub fn new(
        client: CoordinationClient,
        catalog: Arc<RoleCatalog>,
        sink: Arc<dyn ConfigSink>,
        leadership: Leadership,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            catalog,
            sink,
            leadership,
            clock,
            debounce: Duration::from_millis(500),
            apply_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(30),
            last_applied: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// The current routing table, built from instance records.
    pub async fn table(&self) -> RoutingResult<RoutingTable> {
        let instances: Vec<ServiceInstance> = self
            .client
            .list::<ServiceInstance>(paths::INSTANCES)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        let members: Vec<ClusterMember> = self
            .client
            .list::<ClusterMember>(paths::MEMBERS)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        Ok(RoutingTable::build(&self.catalog, &instances, &members))
    }

    /// The last record the leader wrote to `/routing`.
    pub async fn record(&self) -> RoutingResult<Option<RoutingRecord>> {
        Ok(self
            .client
            .get::<RoutingRecord>(paths::ROUTING)
            .await?
            .map(|v| v.value))
    }

    /// Render, validate and apply the current table.
    ///
    /// Returns the applied document, or `None` when the config is
    /// unchanged. On any error the previous config stays in effect.
    pub async fn regenerate(&self) -> RoutingResult<Option<ConfigDocument>> {
        let table = self.table().await?;
        let doc = render(&table);
        validate(&doc)?;

        let mut last = self.last_applied.lock().await;
        if last.as_deref() == Some(doc.digest.as_str()) {
            debug!(digest = %doc.digest, "routing unchanged");
            return Ok(None);
        }

        match tokio::time::timeout(self.apply_timeout, self.sink.apply(&doc)).await {
            Ok(result) => result?,
            Err(_) => return Err(RoutingError::ApplyTimeout(self.apply_timeout)),
        }
        *last = Some(doc.digest.clone());
        info!(
            digest = %doc.digest,
            routes = table.routes.len(),
            backends = table.backend_count(),
            "routing config applied"
        );

        if self.leadership.is_leader() {
            self.publish(&doc, table).await?;
        }
        Ok(Some(doc))
    }

    async fn publish(&self, doc: &ConfigDocument, table: RoutingTable) -> RoutingResult<()> {
        let record = RoutingRecord {
            digest: doc.digest.clone(),
            table,
            applied_at_ms: self.clock.now_ms(),
        };
        for _ in 0..3 {
            let version = self
                .client
                .get::<RoutingRecord>(paths::ROUTING)
                .await?
                .map(|v| v.version)
                .unwrap_or(0);
            match self
                .client
                .compare_and_set(paths::ROUTING, version, &record, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(CoordError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        warn!(digest = %doc.digest, "gave up recording routing digest after conflicts");
        Ok(())
    }

    async fn regenerate_logged(&self) {
        match self.regenerate().await {
            Ok(_) => {}
            Err(RoutingError::Validation(reason)) => {
                error!(%reason, "rendered config rejected, keeping previous config");
            }
            Err(e) => warn!(error = %e, "routing regeneration failed"),
        }
    }

    /// Regenerate on routing-affecting changes, debounced.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut markers = self.client.watch(paths::ROLES);
        let mut members = self.client.watch(paths::MEMBERS);
        info!(debounce = ?self.debounce, "config generator started");
        self.regenerate_logged().await;

        loop {
            let triggered = tokio::select! {
                ev = markers.next() => ev.is_some(),
                ev = members.next() => ev.is_some(),
                _ = tokio::time::sleep(self.resync_interval) => true,
                _ = shutdown.changed() => {
                    info!("config generator shutting down");
                    return;
                }
            };
            if !triggered {
                warn!("coordination watch closed, stopping config generator");
                return;
            }

            // Coalesce the burst that usually follows one change.
            let deadline = tokio::time::sleep(self.debounce);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    Some(ev) = markers.next() => log_event(&ev),
                    Some(ev) = members.next() => log_event(&ev),
                }
            }
            self.regenerate_logged().await;
        }
    }
}

fn log_event(ev: &WatchEvent) {
    match ev {
        WatchEvent::Disconnected => debug!("watch disconnected during debounce"),
        other => debug!(path = other.path().unwrap_or_default(), "routing change coalesced"),
    }
}
