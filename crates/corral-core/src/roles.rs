//! Role catalog — static role definitions and their dependency graph.
//!
//! The graph is checked once, when the catalog is built from
//! configuration: unknown dependencies and cycles are configuration
//! errors, never scheduling conditions. Every role gets a topological
//! rank (0 for roles with no dependencies, otherwise one more than its
//! deepest dependency) used to order starts and, reversed, stops.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RoleTag;

/// Errors detected while building a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("role defined twice: {0}")]
    Duplicate(RoleTag),

    #[error("role {role} depends on undefined role {dependency}")]
    UnknownDependency { role: RoleTag, dependency: RoleTag },

    #[error("dependency cycle among roles: {}", join(.0))]
    Cycle(Vec<RoleTag>),
}

fn join(roles: &[RoleTag]) -> String {
    roles
        .iter()
        .map(RoleTag::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// How the health monitor checks a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Healthy when a TCP connection to `port` succeeds.
    Tcp { port: u16 },
    /// Healthy when `GET path` answers 2xx (or exactly `expect_status`).
    Http {
        port: u16,
        #[serde(default = "default_health_path")]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_status: Option<u16>,
    },
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

/// Proxy mode for a routable role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    #[default]
    Http,
    Tcp,
}

impl RouteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }
}

/// External routing for a role: the proxy listens on `listen_port` and
/// balances across every Ready instance's `backend_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub listen_port: u16,
    pub backend_port: u16,
    #[serde(default)]
    pub mode: RouteMode,
}

/// One `[[roles]]` entry of `corral.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: RoleTag,
    /// Lower places and starts first among otherwise equal roles.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub depends_on: Vec<RoleTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteSpec>,
    /// Command that brings the service up on a member.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_command: Vec<String>,
    /// Command that stops the service on a member.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_command: Vec<String>,
}

fn default_priority() -> u32 {
    100
}

impl RoleDefinition {
    pub fn new(name: &str, priority: u32, depends_on: &[&str]) -> Self {
        Self {
            name: RoleTag::new(name),
            priority,
            depends_on: depends_on.iter().map(|d| RoleTag::new(*d)).collect(),
            probe: None,
            route: None,
            start_command: Vec::new(),
            stop_command: Vec::new(),
        }
    }

    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_route(mut self, listen_port: u16, backend_port: u16, mode: RouteMode) -> Self {
        self.route = Some(RouteSpec {
            listen_port,
            backend_port,
            mode,
        });
        self
    }
}

/// Validated role definitions plus the derived dependency graph.
#[derive(Debug, Clone)]
pub struct RoleCatalog {
    roles: BTreeMap<RoleTag, RoleDefinition>,
    dependents: BTreeMap<RoleTag, BTreeSet<RoleTag>>,
    ranks: BTreeMap<RoleTag, u32>,
}

impl RoleCatalog {
    /// Build and validate a catalog.
    pub fn new(definitions: Vec<RoleDefinition>) -> Result<Self, CatalogError> {
        let mut roles = BTreeMap::new();
        for def in definitions {
            if roles.contains_key(&def.name) {
                return Err(CatalogError::Duplicate(def.name));
            }
            roles.insert(def.name.clone(), def);
        }

        let mut dependents: BTreeMap<RoleTag, BTreeSet<RoleTag>> =
            roles.keys().map(|r| (r.clone(), BTreeSet::new())).collect();
        for def in roles.values() {
            for dep in &def.depends_on {
                let Some(set) = dependents.get_mut(dep) else {
                    return Err(CatalogError::UnknownDependency {
                        role: def.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                set.insert(def.name.clone());
            }
        }

        let ranks = topological_ranks(&roles, &dependents)?;
        Ok(Self {
            roles,
            dependents,
            ranks,
        })
    }

    /// The built-in catalog used when `corral.toml` defines no roles.
    pub fn standard() -> Self {
        let defs = vec![
            RoleDefinition::new("coordination-replica", 0, &[])
                .with_probe(ProbeSpec::Tcp { port: 2181 }),
            RoleDefinition::new("database-shard", 10, &["coordination-replica"])
                .with_probe(ProbeSpec::Tcp { port: 5432 }),
            RoleDefinition::new("broker", 20, &["coordination-replica"])
                .with_probe(ProbeSpec::Tcp { port: 5672 }),
            RoleDefinition::new("presence", 25, &["broker"])
                .with_probe(ProbeSpec::Tcp { port: 5222 }),
            RoleDefinition::new("metrics-collector", 50, &[])
                .with_probe(ProbeSpec::Tcp { port: 2003 }),
            RoleDefinition::new("app-runtime", 30, &["coordination-replica"])
                .with_probe(ProbeSpec::Http {
                    port: 8000,
                    path: default_health_path(),
                    expect_status: None,
                })
                .with_route(8000, 8000, RouteMode::Http),
            RoleDefinition::new("load-balancer", 40, &["app-runtime"])
                .with_probe(ProbeSpec::Tcp { port: 80 })
                .with_route(80, 80, RouteMode::Tcp),
        ];
        // The definitions above are acyclic; failure here is a programming error.
        Self::new(defs).unwrap_or_else(|e| panic!("standard role catalog is invalid: {e}"))
    }

    pub fn get(&self, role: &RoleTag) -> Option<&RoleDefinition> {
        self.roles.get(role)
    }

    pub fn contains(&self, role: &RoleTag) -> bool {
        self.roles.contains_key(role)
    }

    /// All roles in tag order.
    pub fn roles(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values()
    }

    /// Roles `role` depends on.
    pub fn dependencies(&self, role: &RoleTag) -> &[RoleTag] {
        self.roles
            .get(role)
            .map(|d| d.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Roles that depend on `role`.
    pub fn dependents(&self, role: &RoleTag) -> impl Iterator<Item = &RoleTag> {
        self.dependents.get(role).into_iter().flatten()
    }

    /// Topological rank; unknown roles sort last.
    pub fn rank(&self, role: &RoleTag) -> u32 {
        self.ranks.get(role).copied().unwrap_or(u32::MAX)
    }

    /// Configured priority; unknown roles sort last.
    pub fn priority(&self, role: &RoleTag) -> u32 {
        self.roles.get(role).map(|d| d.priority).unwrap_or(u32::MAX)
    }

    /// Start-order key: topological rank, then priority, then tag.
    pub fn start_key<'a>(&self, role: &'a RoleTag) -> (u32, u32, &'a RoleTag) {
        (self.rank(role), self.priority(role), role)
    }

    pub fn route(&self, role: &RoleTag) -> Option<&RouteSpec> {
        self.roles.get(role).and_then(|d| d.route.as_ref())
    }

    pub fn probe(&self, role: &RoleTag) -> Option<&ProbeSpec> {
        self.roles.get(role).and_then(|d| d.probe.as_ref())
    }
}

/// Kahn's algorithm over the dependency edges, recording longest-path depth.
fn topological_ranks(
    roles: &BTreeMap<RoleTag, RoleDefinition>,
    dependents: &BTreeMap<RoleTag, BTreeSet<RoleTag>>,
) -> Result<BTreeMap<RoleTag, u32>, CatalogError> {
    let mut remaining: BTreeMap<&RoleTag, usize> = roles
        .values()
        .map(|d| (&d.name, d.depends_on.iter().collect::<BTreeSet<_>>().len()))
        .collect();
    let mut ranks: BTreeMap<RoleTag, u32> = BTreeMap::new();
    let mut ready: VecDeque<&RoleTag> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(r, _)| *r)
        .collect();

    for role in &ready {
        ranks.insert((*role).clone(), 0);
    }

    while let Some(role) = ready.pop_front() {
        let rank = ranks[role];
        for dependent in dependents.get(role).into_iter().flatten() {
            let entry = ranks.entry(dependent.clone()).or_insert(0);
            *entry = (*entry).max(rank + 1);
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    let cyclic: Vec<RoleTag> = remaining
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(r, _)| r.clone())
        .collect();
    if cyclic.is_empty() {
        Ok(ranks)
    } else {
        Err(CatalogError::Cycle(cyclic))
    }
}
