//! Domain types for the Corral controller.
//!
//! Everything here is stored as JSON in the coordination service. Maps
//! and sets are `BTree*` so that serialized documents, iteration order
//! and therefore every decision derived from them are deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster member.
pub type MemberId = String;

/// Identifier of a lease granted by the coordination service.
pub type LeaseId = u64;

// ── Roles ─────────────────────────────────────────────────────────

/// Identity of a category of service a member can run
/// (e.g. `coordination-replica`, `load-balancer`, `app-runtime`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleTag(String);

impl RoleTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoleTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Members ───────────────────────────────────────────────────────

/// Registry-level state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    /// Heartbeating and eligible for new roles.
    Active,
    /// Lease expired; kept for the grace window so a re-registration can
    /// reclaim its roles. Never receives new roles.
    Suspect,
    /// Being emptied by scale-in; keeps existing roles until drained.
    Draining,
}

/// A machine in the pool, as seen by the node registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: MemberId,
    /// Host or IP the member's services listen on.
    pub address: String,
    /// Arbitrary labels (`host`, `zone`, ...) used by placement constraints.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Roles the controller assigned to this member.
    #[serde(default)]
    pub declared_roles: BTreeSet<RoleTag>,
    /// Roles the member reports it is actually running.
    #[serde(default)]
    pub observed_roles: BTreeSet<RoleTag>,
    /// Unix milliseconds of the last heartbeat.
    pub last_heartbeat_ms: u64,
    pub state: MemberState,
    /// Session lease backing the member's ephemeral records.
    #[serde(default)]
    pub lease: Option<LeaseId>,
    /// When the lease was observed to have expired (Suspect only).
    #[serde(default)]
    pub departed_at_ms: Option<u64>,
}

impl ClusterMember {
    pub fn new(id: impl Into<MemberId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            labels: BTreeMap::new(),
            declared_roles: BTreeSet::new(),
            observed_roles: BTreeSet::new(),
            last_heartbeat_ms: 0,
            state: MemberState::Active,
            lease: None,
            departed_at_ms: None,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether new role instances may be placed on this member.
    pub fn accepts_new_roles(&self) -> bool {
        self.state == MemberState::Active
    }

    /// Value of `label` used for spread constraints. Members without the
    /// label count as their own failure domain.
    pub fn spread_value(&self, label: &str) -> &str {
        self.labels.get(label).map(String::as_str).unwrap_or(&self.id)
    }

    /// Whether the member carries every label in `required`.
    pub fn matches_labels(&self, required: &BTreeMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|mv| mv == v))
    }

    /// Roles the member reports but was never assigned.
    pub fn undeclared_roles(&self) -> Vec<RoleTag> {
        self.observed_roles
            .difference(&self.declared_roles)
            .cloned()
            .collect()
    }
}

// ── Topology ──────────────────────────────────────────────────────

/// Placement constraints for one role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Minimum live instances for the role to be correct at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,
    /// No two instances may share a value of this member label
    /// (`"host"` gives "at most one per physical node").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_label: Option<String>,
    /// Labels a member must carry to host the role.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub required_labels: BTreeMap<String, String>,
}

impl PlacementConstraints {
    /// How many placement rules this role carries; more rules place first.
    pub fn tightness(&self) -> u8 {
        u8::from(self.quorum.is_some())
            + u8::from(self.spread_label.is_some())
            + u8::from(!self.required_labels.is_empty())
    }
}

/// Desired instance count and placement for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTarget {
    pub count: u32,
    #[serde(default)]
    pub constraints: PlacementConstraints,
}

/// Desired role counts and placement for the whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Assigned on acceptance; newer topologies have larger ids.
    #[serde(default)]
    pub id: u64,
    pub roles: BTreeMap<RoleTag, RoleTarget>,
}

impl Topology {
    /// Builder helper: add a role with a count and constraints.
    pub fn with_role(mut self, role: &str, count: u32, constraints: PlacementConstraints) -> Self {
        self.roles
            .insert(RoleTag::new(role), RoleTarget { count, constraints });
        self
    }

    /// Target count for a role (0 when absent).
    pub fn count(&self, role: &RoleTag) -> u32 {
        self.roles.get(role).map(|t| t.count).unwrap_or(0)
    }

    /// Copy of this topology with one role's count replaced.
    pub fn with_count(&self, role: &RoleTag, count: u32) -> Self {
        let mut next = self.clone();
        if let Some(target) = next.roles.get_mut(role) {
            target.count = count;
        }
        next
    }
}

// ── Assignment ────────────────────────────────────────────────────

/// Concrete member → roles mapping satisfying a topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Bumped on every accepted change.
    pub generation: u64,
    /// Id of the topology this assignment satisfies.
    pub topology_id: u64,
    pub members: BTreeMap<MemberId, BTreeSet<RoleTag>>,
}

impl Assignment {
    pub fn roles_of(&self, member: &str) -> Option<&BTreeSet<RoleTag>> {
        self.members.get(member)
    }

    pub fn contains(&self, member: &str, role: &RoleTag) -> bool {
        self.members.get(member).is_some_and(|r| r.contains(role))
    }

    /// Members hosting `role`, in id order.
    pub fn holders(&self, role: &RoleTag) -> Vec<&MemberId> {
        self.members
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn count(&self, role: &RoleTag) -> u32 {
        self.holders(role).len() as u32
    }

    /// Number of roles placed on a member.
    pub fn load(&self, member: &str) -> usize {
        self.members.get(member).map(BTreeSet::len).unwrap_or(0)
    }

    /// Every `(member, role)` pair in deterministic order.
    pub fn pairs(&self) -> impl Iterator<Item = (&MemberId, &RoleTag)> {
        self.members
            .iter()
            .flat_map(|(m, roles)| roles.iter().map(move |r| (m, r)))
    }

    /// Placement equality, ignoring generation and topology id.
    pub fn same_placement(&self, other: &Assignment) -> bool {
        self.members == other.members
    }
}

/// The accepted topology together with the assignment enforcing it.
///
/// Stored as one document at `/assignment` so both change atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePlan {
    pub topology: Topology,
    pub assignment: Assignment,
}

// ── Service instances ─────────────────────────────────────────────

/// Lifecycle state of one role instance on one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Ready or Degraded: the process is up.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identifies an instance: one role on one member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub role: RoleTag,
    pub member: MemberId,
}

impl InstanceKey {
    pub fn new(role: RoleTag, member: impl Into<MemberId>) -> Self {
        Self {
            role,
            member: member.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.member)
    }
}

/// Persisted record of a role instance, owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub member: MemberId,
    pub role: RoleTag,
    pub state: LifecycleState,
    /// Failed start attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Earliest unix ms at which the next start may be attempted.
    #[serde(default)]
    pub next_attempt_at_ms: u64,
    /// Consecutive probe misses as last reported by the health monitor.
    #[serde(default)]
    pub consecutive_misses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at_ms: u64,
}

impl ServiceInstance {
    pub fn new(member: impl Into<MemberId>, role: RoleTag, now_ms: u64) -> Self {
        Self {
            member: member.into(),
            role,
            state: LifecycleState::Pending,
            attempts: 0,
            next_attempt_at_ms: 0,
            consecutive_misses: 0,
            last_error: None,
            updated_at_ms: now_ms,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.role.clone(), self.member.clone())
    }
}

/// Outcome of health evaluation that changes an instance's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    /// Starting instance answered its probe.
    Promote,
    /// Ready instance missed a probe.
    Degrade,
    /// Degraded instance answered again.
    Recover,
    /// Consecutive misses reached the failure threshold.
    Fail,
}
