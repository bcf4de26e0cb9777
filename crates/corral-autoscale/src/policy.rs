//! Scaling policy and breach detection.

use std::time::Duration;

use corral_core::config::ScalingPolicyConfig;

use crate::signals::RoleSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Out,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min: u32,
    pub max: u32,
    pub step: u32,
    pub unhealthy_ratio: f64,
    pub load_high: Option<f64>,
    pub load_low: Option<f64>,
    pub window: Duration,
}

impl From<&ScalingPolicyConfig> for ScalingPolicy {
    fn from(c: &ScalingPolicyConfig) -> Self {
        Self {
            min: c.min,
            max: c.max,
            step: c.step.max(1),
            unhealthy_ratio: c.unhealthy_ratio,
            load_high: c.load_high,
            load_low: c.load_low,
            window: c.window,
        }
    }
}

impl ScalingPolicy {
    /// Which way the signals push, if at all. Unhealthy instances or high
    /// load push out; low load pushes in only when nothing is unhealthy.
    pub fn classify(&self, signals: &RoleSignals) -> Option<Breach> {
        if signals.total > 0 && signals.unhealthy_ratio() > self.unhealthy_ratio {
            return Some(Breach::Out);
        }
        if let (Some(high), Some(load)) = (self.load_high, signals.load) {
            if load > high {
                return Some(Breach::Out);
            }
        }
        if let (Some(low), Some(load)) = (self.load_low, signals.load) {
            if load < low && signals.degraded + signals.failed == 0 {
                return Some(Breach::In);
            }
        }
        None
    }

    /// Target count after acting on `breach`, clamped to the policy and
    /// to `floor` (quorum) on the way down.
    pub fn target(&self, current: u32, breach: Breach, floor: u32) -> u32 {
        match breach {
            Breach::Out => current.saturating_add(self.step).min(self.max).max(current),
            Breach::In => current
                .saturating_sub(self.step)
                .max(self.min)
                .max(floor)
                .min(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min: 2,
            max: 5,
            step: 2,
            unhealthy_ratio: 0.5,
            load_high: Some(100.0),
            load_low: Some(10.0),
            window: Duration::from_secs(60),
        }
    }

    fn signals(total: u32, ready: u32, degraded: u32, load: Option<f64>) -> RoleSignals {
        RoleSignals {
            total,
            ready,
            degraded,
            failed: 0,
            load,
        }
    }

    #[test]
    fn classifies_breaches() {
        let p = policy();
        assert_eq!(p.classify(&signals(4, 1, 3, None)), Some(Breach::Out));
        assert_eq!(p.classify(&signals(4, 2, 2, None)), None);
        assert_eq!(p.classify(&signals(4, 4, 0, Some(150.0))), Some(Breach::Out));
        assert_eq!(p.classify(&signals(4, 4, 0, Some(5.0))), Some(Breach::In));
        // Low load never shrinks a role that has unhealthy instances.
        assert_eq!(p.classify(&signals(4, 3, 1, Some(5.0))), None);
    }

    #[test]
    fn targets_are_clamped() {
        let p = policy();
        assert_eq!(p.target(2, Breach::Out, 0), 4);
        assert_eq!(p.target(4, Breach::Out, 0), 5);
        assert_eq!(p.target(5, Breach::Out, 0), 5);
        assert_eq!(p.target(5, Breach::In, 0), 3);
        assert_eq!(p.target(3, Breach::In, 0), 2);
        assert_eq!(p.target(4, Breach::In, 3), 3);
        // Already below the floor: scale-in never grows.
        assert_eq!(p.target(1, Breach::In, 0), 1);
    }
}
