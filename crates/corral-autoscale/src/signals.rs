//! Per-role scaling inputs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use corral_core::{LifecycleState, RoleTag, ServiceInstance};

/// Health aggregate for one role, plus external load if a feed has it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleSignals {
    pub total: u32,
    pub ready: u32,
    pub degraded: u32,
    pub failed: u32,
    /// Load per instance from the external feed.
    pub load: Option<f64>,
}

impl RoleSignals {
    /// Fraction of instances that are Degraded or Failed.
    pub fn unhealthy_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.degraded + self.failed) / f64::from(self.total)
    }

    pub fn all_ready(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }
}

/// Count instance states per role.
pub fn aggregate(records: &[ServiceInstance]) -> BTreeMap<RoleTag, RoleSignals> {
    let mut out: BTreeMap<RoleTag, RoleSignals> = BTreeMap::new();
    for rec in records {
        let s = out.entry(rec.role.clone()).or_default();
        s.total += 1;
        match rec.state {
            LifecycleState::Ready => s.ready += 1,
            LifecycleState::Degraded => s.degraded += 1,
            LifecycleState::Failed => s.failed += 1,
            _ => {}
        }
    }
    out
}

/// External load source, e.g. request rate per instance.
#[async_trait]
pub trait LoadFeed: Send + Sync + 'static {
    async fn load(&self, role: &RoleTag) -> Option<f64>;
}

/// Load values set by hand (operator overrides, tests).
#[derive(Debug, Default)]
pub struct StaticLoadFeed {
    values: Mutex<BTreeMap<RoleTag, f64>>,
}

impl StaticLoadFeed {
    pub fn set(&self, role: &str, load: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(RoleTag::new(role), load);
        }
    }
}

#[async_trait]
impl LoadFeed for StaticLoadFeed {
    async fn load(&self, role: &RoleTag) -> Option<f64> {
        self.values.lock().ok().and_then(|v| v.get(role).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(role: &str, member: &str, state: LifecycleState) -> ServiceInstance {
        let mut r = ServiceInstance::new(member, RoleTag::new(role), 0);
        r.state = state;
        r
    }

    #[test]
    fn aggregates_by_role() {
        let records = vec![
            rec("app-runtime", "m1", LifecycleState::Ready),
            rec("app-runtime", "m2", LifecycleState::Degraded),
            rec("app-runtime", "m3", LifecycleState::Failed),
            rec("app-runtime", "m4", LifecycleState::Starting),
            rec("broker", "m1", LifecycleState::Ready),
        ];
        let signals = aggregate(&records);
        let app = &signals[&RoleTag::new("app-runtime")];
        assert_eq!(app.total, 4);
        assert_eq!(app.unhealthy_ratio(), 0.5);
        assert!(!app.all_ready());
        assert!(signals[&RoleTag::new("broker")].all_ready());
    }

    #[tokio::test]
    async fn static_feed_returns_set_values() {
        let feed = StaticLoadFeed::default();
        feed.set("app-runtime", 42.0);
        assert_eq!(feed.load(&RoleTag::new("app-runtime")).await, Some(42.0));
        assert_eq!(feed.load(&RoleTag::new("broker")).await, None);
    }
}
