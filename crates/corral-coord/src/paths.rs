//! Coordination path layout.
//!
//! ```text
//! /members/{id}                        member record (ephemeral, member lease)
//! /assignment                          active plan (versioned)
//! /instances/{role}/{member}           lifecycle record (durable)
//! /roles/{role}/instances/{member}     Ready/Degraded marker (ephemeral)
//! /health/{observer}/{role}/{member}   probe report (ephemeral, observer lease)
//! /routing                             last applied routing digest
//! /leader                              leader lock (ephemeral)
//! ```

use corral_core::{InstanceKey, RoleTag};

pub const MEMBERS: &str = "/members/";
pub const ASSIGNMENT: &str = "/assignment";
pub const INSTANCES: &str = "/instances/";
pub const ROLES: &str = "/roles/";
pub const HEALTH: &str = "/health/";
pub const ROUTING: &str = "/routing";
pub const LEADER: &str = "/leader";

pub fn member(id: &str) -> String {
    format!("{MEMBERS}{id}")
}

pub fn instance(key: &InstanceKey) -> String {
    format!("{INSTANCES}{}/{}", key.role, key.member)
}

pub fn role_marker(key: &InstanceKey) -> String {
    format!("{ROLES}{}/instances/{}", key.role, key.member)
}

pub fn health_report(observer: &str, key: &InstanceKey) -> String {
    format!("{HEALTH}{observer}/{}/{}", key.role, key.member)
}

/// Member id from a `/members/{id}` path.
pub fn member_id(path: &str) -> Option<&str> {
    path.strip_prefix(MEMBERS).filter(|id| !id.is_empty())
}

/// Instance key from a `/instances/{role}/{member}` path.
pub fn instance_key(path: &str) -> Option<InstanceKey> {
    let rest = path.strip_prefix(INSTANCES)?;
    let (role, member) = rest.split_once('/')?;
    if role.is_empty() || member.is_empty() {
        return None;
    }
    Some(InstanceKey::new(RoleTag::new(role), member))
}

/// Instance key from a `/roles/{role}/instances/{member}` path.
pub fn role_marker_key(path: &str) -> Option<InstanceKey> {
    let rest = path.strip_prefix(ROLES)?;
    let (role, member) = rest.split_once("/instances/")?;
    if role.is_empty() || member.is_empty() || member.contains('/') {
        return None;
    }
    Some(InstanceKey::new(RoleTag::new(role), member))
}

/// Observer and instance key from a `/health/{observer}/{role}/{member}` path.
pub fn health_report_key(path: &str) -> Option<(&str, InstanceKey)> {
    let rest = path.strip_prefix(HEALTH)?;
    let mut parts = rest.splitn(3, '/');
    let observer = parts.next().filter(|s| !s.is_empty())?;
    let role = parts.next().filter(|s| !s.is_empty())?;
    let member = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((observer, InstanceKey::new(RoleTag::new(role), member)))
}
