//! Probe hysteresis and multi-observer merge.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use corral_core::{HealthVerdict, InstanceKey, LifecycleState};

/// One observer's latest probe of one instance, stored ephemerally at
/// `/health/{observer}/{role}/{member}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub observer: String,
    pub healthy: bool,
    pub observed_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Merge observer reports into one result.
///
/// Reports older than `freshness` are ignored. Healthy wins when at least
/// half of the fresh reports are healthy; `None` when nothing is fresh.
pub fn merge_reports(reports: &[HealthReport], now_ms: u64, freshness: Duration) -> Option<bool> {
    let horizon = now_ms.saturating_sub(freshness.as_millis() as u64);
    let fresh: Vec<&HealthReport> = reports
        .iter()
        .filter(|r| r.observed_at_ms >= horizon)
        .collect();
    if fresh.is_empty() {
        return None;
    }
    let healthy = fresh.iter().filter(|r| r.healthy).count();
    Some(healthy * 2 >= fresh.len())
}

/// Consecutive-miss bookkeeping per instance.
///
/// Ready goes to Degraded on the first miss; Degraded goes to Failed once
/// misses reach the threshold. A success promotes Starting and recovers
/// Degraded.
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    misses: BTreeMap<InstanceKey, u32>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            misses: BTreeMap::new(),
        }
    }

    pub fn misses(&self, key: &InstanceKey) -> u32 {
        self.misses.get(key).copied().unwrap_or(0)
    }

    /// Start counting from a persisted miss count, unless this tracker
    /// already follows the instance.
    pub fn seed(&mut self, key: &InstanceKey, misses: u32) {
        if misses > 0 {
            self.misses.entry(key.clone()).or_insert(misses);
        }
    }

    /// Record one merged result for an instance in `state`; returns the
    /// verdict to apply (with the current miss count), if any.
    pub fn observe(
        &mut self,
        key: &InstanceKey,
        state: LifecycleState,
        healthy: bool,
    ) -> Option<(HealthVerdict, u32)> {
        if healthy {
            self.misses.remove(key);
            return match state {
                LifecycleState::Starting => Some((HealthVerdict::Promote, 0)),
                LifecycleState::Degraded => Some((HealthVerdict::Recover, 0)),
                _ => None,
            };
        }

        let misses = self.misses.entry(key.clone()).or_default();
        *misses += 1;
        let misses = *misses;
        match state {
            LifecycleState::Ready => {
                debug!(instance = %key, misses, "probe missed");
                Some((HealthVerdict::Degrade, misses))
            }
            LifecycleState::Degraded if misses >= self.failure_threshold => {
                warn!(instance = %key, misses, threshold = self.failure_threshold, "failure threshold reached");
                Some((HealthVerdict::Fail, misses))
            }
            _ => None,
        }
    }

    /// Drop counters for instances that are no longer probed.
    pub fn retain(&mut self, live: &BTreeSet<InstanceKey>) {
        self.misses.retain(|k, _| live.contains(k));
    }
}
