//! corral-health — probes role instances and turns results into verdicts.
//!
//! Every controller probes every Starting, Ready and Degraded instance
//! and publishes its view under `/health/{observer}/…`. The leader
//! merges the fresh views, runs them through the [`HealthTracker`]
//! hysteresis and hands the resulting verdicts to the lifecycle manager.
//!
//! ```text
//! HealthMonitor::tick
//!   ├── poll_once   ProbeTable → probe_with_deadline → ProbeOutcome
//!   ├── publish     /health/{observer}/{role}/{member} (ephemeral)
//!   └── evaluate    (leader) merge_reports → HealthTracker → apply_verdict
//! ```

pub mod error;
pub mod monitor;
pub mod probe;
pub mod tracker;

pub use error::{HealthError, HealthResult};
pub use monitor::HealthMonitor;
pub use probe::{HttpProbe, Probe, ProbeOutcome, ProbeTable, TcpProbe, probe_with_deadline};
pub use tracker::{HealthReport, HealthTracker, merge_reports};
