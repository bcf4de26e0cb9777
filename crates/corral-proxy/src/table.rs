//! Routing table — Ready instances of every routable role.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use corral_core::{
    ClusterMember, LifecycleState, MemberId, RoleCatalog, RoleTag, RouteMode, ServiceInstance,
};

/// A backend endpoint that can serve traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub member: MemberId,
    pub address: String,
    pub port: u16,
}

impl Backend {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One proxied role: a listener and its backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub role: RoleTag,
    pub listen_port: u16,
    pub mode: RouteMode,
    /// Sorted by member id.
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Sorted by role.
    pub routes: Vec<Route>,
}

impl RoutingTable {
    /// Build from instance records: only Ready instances on members with
    /// a known address are routed. Every routable role gets a route,
    /// even with no backends, so listeners stay stable.
    pub fn build(
        catalog: &RoleCatalog,
        instances: &[ServiceInstance],
        members: &[ClusterMember],
    ) -> Self {
        let addresses: BTreeMap<&str, &str> = members
            .iter()
            .map(|m| (m.id.as_str(), m.address.as_str()))
            .collect();

        let mut routes: BTreeMap<&RoleTag, Route> = BTreeMap::new();
        for def in catalog.roles() {
            if let Some(spec) = &def.route {
                routes.insert(
                    &def.name,
                    Route {
                        role: def.name.clone(),
                        listen_port: spec.listen_port,
                        mode: spec.mode,
                        backends: Vec::new(),
                    },
                );
            }
        }

        for inst in instances {
            if inst.state != LifecycleState::Ready {
                continue;
            }
            let Some(route) = routes.get_mut(&inst.role) else {
                continue;
            };
            let Some(address) = addresses.get(inst.member.as_str()) else {
                continue;
            };
            let Some(spec) = catalog.route(&inst.role) else {
                continue;
            };
            route.backends.push(Backend {
                member: inst.member.clone(),
                address: address.to_string(),
                port: spec.backend_port,
            });
        }

        let mut routes: Vec<Route> = routes.into_values().collect();
        for route in &mut routes {
            route.backends.sort_by(|a, b| a.member.cmp(&b.member));
        }
        Self { routes }
    }

    pub fn route(&self, role: &RoleTag) -> Option<&Route> {
        self.routes.iter().find(|r| &r.role == role)
    }

    /// Members currently routed for `role`.
    pub fn members_for(&self, role: &RoleTag) -> Vec<&str> {
        self.route(role)
            .map(|r| r.backends.iter().map(|b| b.member.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn backend_count(&self) -> usize {
        self.routes.iter().map(|r| r.backends.len()).sum()
    }
}
