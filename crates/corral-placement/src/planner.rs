//! Placement planner — greedy constraint satisfaction.
//!
//! Roles are placed tightest first: more placement rules (quorum,
//! spread, required labels) before fewer, then by catalog priority,
//! then by tag. Planning runs in two passes over that order:
//!
//! 1. **Retain**: every role keeps its current holders that are still
//!    members and still satisfy its constraints, Ready instances first.
//!    A Ready instance therefore only moves when the topology shrinks
//!    the role or its host is gone.
//! 2. **Fill**: missing instances go to eligible members in ascending
//!    load, ties broken by member id.
//!
//! If any role cannot reach its count the whole topology is infeasible;
//! there is no partial result.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use corral_core::{
    Assignment, ClusterMember, InstanceKey, MemberId, RoleCatalog, RoleTag, RoleTarget, Topology,
};

use crate::error::{AssignError, AssignResult};

/// Check a topology against the catalog before planning it.
pub fn validate_topology(topology: &Topology, catalog: &RoleCatalog) -> AssignResult<()> {
    for (role, target) in &topology.roles {
        if !catalog.contains(role) {
            return Err(AssignError::UnknownRole(role.clone()));
        }
        if let Some(quorum) = target.constraints.quorum {
            if target.count < quorum {
                return Err(AssignError::BelowQuorum {
                    role: role.clone(),
                    count: target.count,
                    quorum,
                });
            }
        }
        if target.count == 0 {
            continue;
        }
        for dependency in catalog.dependencies(role) {
            if topology.count(dependency) == 0 {
                return Err(AssignError::MissingDependency {
                    role: role.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Compute the assignment satisfying `topology`.
///
/// `members` is the registry snapshot: suspect members may keep what
/// they hold but receive nothing new. `ready` lists instances currently
/// Ready, which are preferred when a role has more holders than slots.
/// Identical inputs always give identical output.
pub fn compute_assignment(
    current: &Assignment,
    members: &[ClusterMember],
    topology: &Topology,
    catalog: &RoleCatalog,
    ready: &BTreeSet<InstanceKey>,
) -> AssignResult<Assignment> {
    let by_id: BTreeMap<&str, &ClusterMember> =
        members.iter().map(|m| (m.id.as_str(), m)).collect();
    let order = placement_order(topology, catalog);

    let mut placed: BTreeMap<MemberId, BTreeSet<RoleTag>> = BTreeMap::new();
    let mut load: BTreeMap<&str, usize> = by_id.keys().map(|id| (*id, 0)).collect();

    // Pass 1: retain.
    for (role, target) in &order {
        let mut holders: Vec<&MemberId> = current
            .holders(role)
            .into_iter()
            .filter(|id| {
                by_id
                    .get(id.as_str())
                    .is_some_and(|m| m.matches_labels(&target.constraints.required_labels))
            })
            .collect();
        holders.sort_by_key(|id| {
            let key = InstanceKey::new((*role).clone(), id.as_str());
            (!ready.contains(&key), (*id).clone())
        });

        let mut domains = BTreeSet::new();
        let mut kept = 0;
        for id in holders {
            if kept == target.count {
                break;
            }
            let member = by_id[id.as_str()];
            if let Some(label) = &target.constraints.spread_label {
                if !domains.insert(member.spread_value(label)) {
                    continue;
                }
            }
            placed.entry(id.clone()).or_default().insert((*role).clone());
            *load.entry(id.as_str()).or_default() += 1;
            kept += 1;
        }
    }

    // Pass 2: fill.
    for (role, target) in &order {
        let holding: Vec<&str> = placed
            .iter()
            .filter(|(_, roles)| roles.contains(*role))
            .map(|(id, _)| id.as_str())
            .collect();
        let mut have = holding.len() as u32;
        let mut domains: BTreeSet<&str> = match &target.constraints.spread_label {
            Some(label) => holding
                .iter()
                .map(|id| by_id[id].spread_value(label))
                .collect(),
            None => BTreeSet::new(),
        };

        while have < target.count {
            let candidate = members
                .iter()
                .filter(|m| m.accepts_new_roles())
                .filter(|m| m.matches_labels(&target.constraints.required_labels))
                .filter(|m| !placed.get(&m.id).is_some_and(|r| r.contains(*role)))
                .filter(|m| match &target.constraints.spread_label {
                    Some(label) => !domains.contains(m.spread_value(label)),
                    None => true,
                })
                .min_by_key(|m| (load.get(m.id.as_str()).copied().unwrap_or(0), m.id.clone()));

            let Some(member) = candidate else {
                warn!(role = %role, required = target.count, available = have, "role cannot be placed");
                return Err(AssignError::Infeasible {
                    role: (*role).clone(),
                    required: target.count,
                    available: have,
                });
            };

            if let Some(label) = &target.constraints.spread_label {
                domains.insert(member.spread_value(label));
            }
            placed
                .entry(member.id.clone())
                .or_default()
                .insert((*role).clone());
            *load.entry(member.id.as_str()).or_default() += 1;
            have += 1;
            debug!(role = %role, member = %member.id, "placed role instance");
        }
    }

    Ok(Assignment {
        generation: current.generation + 1,
        topology_id: topology.id,
        members: placed,
    })
}

/// Roles in placement order: tightest, then priority, then tag.
fn placement_order<'a>(
    topology: &'a Topology,
    catalog: &RoleCatalog,
) -> Vec<(&'a RoleTag, &'a RoleTarget)> {
    let mut order: Vec<_> = topology.roles.iter().collect();
    order.sort_by_key(|(role, target)| {
        (
            Reverse(target.constraints.tightness()),
            catalog.priority(role),
            *role,
        )
    });
    order
}
