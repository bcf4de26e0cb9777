//! RoleAssigner — commits plans to `/assignment`.
//!
//! The active topology and its assignment are one versioned document,
//! so both change atomically. Every commit reads the document, plans
//! against it and writes it back with compare-and-set; when another
//! writer got there first the plan is recomputed against the fresh
//! document, up to `max_retries` times.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use corral_coord::{CoordError, CoordinationClient, Leadership, Versioned, paths};
use corral_core::{ActivePlan, InstanceKey, LifecycleState, RoleCatalog, RoleTag, Topology};
use corral_registry::NodeRegistry;

use crate::error::{AssignError, AssignResult};
use crate::planner::{compute_assignment, validate_topology};

pub struct RoleAssigner {
    client: CoordinationClient,
    registry: Arc<NodeRegistry>,
    catalog: Arc<RoleCatalog>,
    leadership: Leadership,
    max_retries: u32,
}

impl RoleAssigner {
    pub fn new(
        client: CoordinationClient,
        registry: Arc<NodeRegistry>,
        catalog: Arc<RoleCatalog>,
        leadership: Leadership,
    ) -> Self {
        Self {
            client,
            registry,
            catalog,
            leadership,
            max_retries: 5,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn catalog(&self) -> &RoleCatalog {
        &self.catalog
    }

    /// The active plan, if a topology was ever accepted.
    pub async fn active_plan(&self) -> AssignResult<Option<Versioned<ActivePlan>>> {
        Ok(self.client.get::<ActivePlan>(paths::ASSIGNMENT).await?)
    }

    /// Accept a new topology: validate, plan and commit.
    ///
    /// On `Infeasible` the active assignment is left untouched.
    pub async fn submit(&self, topology: Topology) -> AssignResult<ActivePlan> {
        validate_topology(&topology, &self.catalog)?;
        let plan = self.commit(Some(&topology)).await?;
        // A requested topology always produces a write.
        plan.ok_or(AssignError::Cancelled)
    }

    /// Re-plan the active topology against current membership.
    ///
    /// Returns the new plan, or `None` when placement did not change
    /// (or no topology has been accepted yet).
    pub async fn reconcile(&self) -> AssignResult<Option<ActivePlan>> {
        let result = self.commit(None).await?;
        if result.is_none() {
            if let Some(current) = self.active_plan().await? {
                self.sync_declared(&current.value).await;
            }
        }
        Ok(result)
    }

    async fn commit(&self, requested: Option<&Topology>) -> AssignResult<Option<ActivePlan>> {
        if !self.leadership.is_leader() {
            return Err(AssignError::NotLeader);
        }
        let mut leadership = self.leadership.clone();
        tokio::select! {
            result = self.commit_with_retries(requested) => result,
            _ = leadership.lost() => {
                warn!("leadership lost, abandoning assignment write");
                Err(AssignError::Cancelled)
            }
        }
    }

    async fn commit_with_retries(
        &self,
        requested: Option<&Topology>,
    ) -> AssignResult<Option<ActivePlan>> {
        for attempt in 1..=self.max_retries {
            let (version, current) = match self.active_plan().await? {
                Some(v) => (v.version, v.value),
                None if requested.is_none() => return Ok(None),
                None => (0, ActivePlan::default()),
            };

            let topology = match requested {
                Some(t) => Topology {
                    id: current.topology.id + 1,
                    roles: t.roles.clone(),
                },
                None => current.topology.clone(),
            };

            let members = self.registry.list_members().await?;
            let ready = self.ready_instances().await?;
            let assignment = compute_assignment(
                &current.assignment,
                &members,
                &topology,
                &self.catalog,
                &ready,
            )?;

            if requested.is_none() && assignment.same_placement(&current.assignment) {
                debug!(generation = current.assignment.generation, "assignment unchanged");
                return Ok(None);
            }

            let next = ActivePlan {
                topology,
                assignment,
            };
            match self
                .client
                .compare_and_set(paths::ASSIGNMENT, version, &next, None)
                .await
            {
                Ok(_) => {
                    info!(
                        topology = next.topology.id,
                        generation = next.assignment.generation,
                        members = next.assignment.members.len(),
                        "assignment committed"
                    );
                    self.sync_declared(&next).await;
                    return Ok(Some(next));
                }
                Err(CoordError::VersionConflict { .. }) => {
                    warn!(attempt, "assignment changed concurrently, recomputing");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AssignError::AssignmentConflict {
            attempts: self.max_retries,
        })
    }

    /// Instances with a Ready marker.
    async fn ready_instances(&self) -> AssignResult<BTreeSet<InstanceKey>> {
        let markers = self.client.list::<LifecycleState>(paths::ROLES).await?;
        Ok(markers
            .into_iter()
            .filter(|m| m.value == LifecycleState::Ready)
            .filter_map(|m| paths::role_marker_key(&m.path))
            .collect())
    }

    /// Push declared roles to member records that disagree with the plan.
    async fn sync_declared(&self, plan: &ActivePlan) {
        let wanted: &BTreeMap<String, BTreeSet<RoleTag>> = &plan.assignment.members;
        for member in self.registry.snapshot().await {
            let roles = wanted.get(&member.id).cloned().unwrap_or_default();
            if roles == member.declared_roles {
                continue;
            }
            if let Err(e) = self.registry.declare_roles(&member.id, roles).await {
                warn!(member = %member.id, error = %e, "failed to declare roles");
            }
        }
    }
}
