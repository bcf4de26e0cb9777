//! corral.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;
use crate::roles::{CatalogError, RoleCatalog, RoleDefinition};
use crate::types::RoleTag;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid role graph: {0}")]
    Catalog(#[from] CatalogError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub controller: ControllerSection,
    pub assigner: AssignerSection,
    pub lifecycle: LifecycleSection,
    pub health: HealthSection,
    pub routing: RoutingSection,
    pub scaling: ScalingSection,
    /// Role definitions; the standard catalog is used when empty.
    pub roles: Vec<RoleDefinition>,
    /// Members registered and heartbeated by this controller process.
    pub members: Vec<MemberSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub node_id: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    #[serde(with = "serde_str")]
    pub lease_ttl: Duration,
    #[serde(with = "serde_str")]
    pub heartbeat_interval: Duration,
    /// How long an expired member may be reclaimed before it is dropped.
    #[serde(with = "serde_str")]
    pub grace_window: Duration,
    #[serde(with = "serde_str")]
    pub coordination_timeout: Duration,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            node_id: "controller-1".to_string(),
            api_port: 8470,
            data_dir: PathBuf::from("/var/lib/corral"),
            lease_ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            grace_window: Duration::from_secs(30),
            coordination_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignerSection {
    /// Compare-and-set attempts before `AssignmentConflict`.
    pub max_retries: u32,
}

impl Default for AssignerSection {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    #[serde(with = "serde_str")]
    pub start_timeout: Duration,
    /// Bound on one stop sequence; an instance that overruns it is Failed.
    #[serde(with = "serde_str")]
    pub stop_timeout: Duration,
    pub max_start_attempts: u32,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
    #[serde(with = "serde_str")]
    pub reconcile_interval: Duration,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            max_start_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Consecutive misses before a Degraded instance is Failed.
    pub failure_threshold: u32,
    #[serde(with = "serde_str")]
    pub probe_deadline: Duration,
    /// Observer reports older than this are ignored when merging.
    #[serde(with = "serde_str")]
    pub report_freshness: Duration,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            probe_deadline: Duration::from_secs(2),
            report_freshness: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// Where the rendered proxy configuration is written.
    pub output_path: Option<PathBuf>,
    /// Command run after writing (e.g. `["systemctl", "reload", "haproxy"]`).
    pub reload_command: Vec<String>,
    #[serde(with = "serde_str")]
    pub debounce: Duration,
    #[serde(with = "serde_str")]
    pub apply_timeout: Duration,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            output_path: None,
            reload_command: Vec::new(),
            debounce: Duration::from_millis(500),
            apply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    pub policies: BTreeMap<RoleTag, ScalingPolicyConfig>,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            policies: BTreeMap::new(),
        }
    }
}

/// Per-role autoscaling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicyConfig {
    pub min: u32,
    pub max: u32,
    #[serde(default = "default_step")]
    pub step: u32,
    /// Scale out when the Degraded+Failed fraction stays above this.
    #[serde(default = "default_unhealthy_ratio")]
    pub unhealthy_ratio: f64,
    /// Scale out when external load per instance stays above this.
    #[serde(default)]
    pub load_high: Option<f64>,
    /// Scale in when external load per instance stays below this.
    #[serde(default)]
    pub load_low: Option<f64>,
    /// How long a breach must persist before acting.
    #[serde(default = "default_window", with = "serde_str")]
    pub window: Duration,
}

fn default_step() -> u32 {
    1
}

fn default_unhealthy_ratio() -> f64 {
    0.5
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

/// A member this controller process registers itself (`[[members]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSeed {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ControllerConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), roles = config.roles.len(), "controller config loaded");
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The role catalog this config describes.
    pub fn catalog(&self) -> Result<RoleCatalog, CatalogError> {
        if self.roles.is_empty() {
            Ok(RoleCatalog::standard())
        } else {
            RoleCatalog::new(self.roles.clone())
        }
    }

    /// Static checks: acyclic role graph, sane thresholds, known policy roles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let catalog = self.catalog()?;

        if self.controller.heartbeat_interval >= self.controller.lease_ttl {
            return Err(ConfigError::Invalid(
                "controller.heartbeat_interval must be shorter than lease_ttl".into(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.lifecycle.max_start_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.max_start_attempts must be at least 1".into(),
            ));
        }
        for (role, policy) in &self.scaling.policies {
            if !catalog.contains(role) {
                return Err(ConfigError::Invalid(format!(
                    "scaling policy for undefined role {role}"
                )));
            }
            if policy.min > policy.max || policy.step == 0 {
                return Err(ConfigError::Invalid(format!(
                    "scaling policy for {role} needs min <= max and step >= 1"
                )));
            }
        }
        Ok(())
    }
}
