//! REST API handlers for topology, membership, instances and routing.
//!
//! Reads come from the registry cache and the coordination service;
//! writes go through the role assigner and the lifecycle manager, so
//! every invariant those enforce holds for API callers too.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use corral_coord::CoordError;
use corral_core::{InstanceKey, RoleTag, Topology};
use corral_lifecycle::LifecycleError;
use corral_placement::AssignError;
use corral_proxy::RoutingError;
use corral_registry::RegistryError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Error mapping ──────────────────────────────────────────────

fn coord_status(e: &CoordError) -> StatusCode {
    match e {
        CoordError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        CoordError::VersionConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Stale => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Conflict(_) => StatusCode::CONFLICT,
        RegistryError::Coord(e) => coord_status(e),
    }
}

fn assign_status(e: &AssignError) -> StatusCode {
    match e {
        AssignError::Infeasible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AssignError::UnknownRole(_)
        | AssignError::BelowQuorum { .. }
        | AssignError::MissingDependency { .. } => StatusCode::BAD_REQUEST,
        AssignError::AssignmentConflict { .. } => StatusCode::CONFLICT,
        AssignError::NotLeader | AssignError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        AssignError::Registry(e) => registry_status(e),
        AssignError::Coord(e) => coord_status(e),
    }
}

fn lifecycle_status(e: &LifecycleError) -> StatusCode {
    match e {
        LifecycleError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::IllegalTransition { .. } => StatusCode::CONFLICT,
        LifecycleError::NotLeader | LifecycleError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::Coord(e) => coord_status(e),
    }
}

fn routing_status(e: &RoutingError) -> StatusCode {
    match e {
        RoutingError::Coord(e) => coord_status(e),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Topology ───────────────────────────────────────────────────

/// POST /api/v1/topology
///
/// Accepted topologies are planned and committed before responding; the
/// instances themselves come up asynchronously, hence 202.
pub async fn submit_topology(
    State(state): State<ApiState>,
    Json(topology): Json<Topology>,
) -> impl IntoResponse {
    match state.assigner.submit(topology).await {
        Ok(plan) => {
            info!(
                topology = plan.topology.id,
                generation = plan.assignment.generation,
                "topology accepted via API"
            );
            (StatusCode::ACCEPTED, ApiResponse::ok(plan)).into_response()
        }
        Err(e) => {
            let status = assign_status(&e);
            if status.is_server_error() {
                warn!(error = %e, "topology submission failed");
            }
            error_response(&e.to_string(), status).into_response()
        }
    }
}

/// GET /api/v1/topology
pub async fn get_topology(State(state): State<ApiState>) -> impl IntoResponse {
    match state.assigner.active_plan().await {
        Ok(Some(plan)) => ApiResponse::ok(plan.value.topology).into_response(),
        Ok(None) => error_response("no topology accepted yet", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), assign_status(&e)).into_response(),
    }
}

/// Assignment view with the stored document version.
#[derive(serde::Serialize)]
pub struct AssignmentView {
    pub version: u64,
    pub assignment: corral_core::Assignment,
}

/// GET /api/v1/assignment
pub async fn get_assignment(State(state): State<ApiState>) -> impl IntoResponse {
    match state.assigner.active_plan().await {
        Ok(Some(plan)) => ApiResponse::ok(AssignmentView {
            version: plan.version,
            assignment: plan.value.assignment,
        })
        .into_response(),
        Ok(None) => error_response("no assignment yet", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), assign_status(&e)).into_response(),
    }
}

// ── Members ────────────────────────────────────────────────────

/// GET /api/v1/members
pub async fn list_members(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list_members().await {
        Ok(members) => ApiResponse::ok(members).into_response(),
        Err(e) => error_response(&e.to_string(), registry_status(&e)).into_response(),
    }
}

/// GET /api/v1/members/{id}
pub async fn get_member(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&id).await {
        Ok(member) => ApiResponse::ok(member).into_response(),
        Err(e) => error_response(&e.to_string(), registry_status(&e)).into_response(),
    }
}

/// GET /api/v1/anomalies
pub async fn list_anomalies(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.anomalies().await)
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.lifecycle.instances().await {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), lifecycle_status(&e)).into_response(),
    }
}

/// POST /api/v1/instances/{role}/{member}/reset
pub async fn reset_instance(
    State(state): State<ApiState>,
    Path((role, member)): Path<(String, String)>,
) -> impl IntoResponse {
    if !state.leadership.is_leader() {
        return error_response("this controller is not the leader", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    let key = InstanceKey::new(RoleTag::new(role), member);
    match state.lifecycle.reset(&key).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => error_response(&e.to_string(), lifecycle_status(&e)).into_response(),
    }
}

// ── Routing ────────────────────────────────────────────────────

/// GET /api/v1/routing
pub async fn get_routing(State(state): State<ApiState>) -> impl IntoResponse {
    match state.routing.record().await {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => {
            error_response("no routing config applied yet", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), routing_status(&e)).into_response(),
    }
}

// ── Liveness ───────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct HealthzView {
    pub node_id: String,
    pub leader: bool,
    pub registry_stale: bool,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(HealthzView {
        node_id: state.node_id.clone(),
        leader: state.leadership.is_leader(),
        registry_stale: state.registry.is_stale(),
    })
}
