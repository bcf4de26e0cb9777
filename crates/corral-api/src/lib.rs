//! corral-api — REST API for the Corral controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/topology` | Submit a topology (202, 422 infeasible) |
//! | GET | `/api/v1/topology` | Active topology |
//! | GET | `/api/v1/assignment` | Active assignment |
//! | GET | `/api/v1/members` | List members |
//! | GET | `/api/v1/members/{id}` | Get one member |
//! | GET | `/api/v1/anomalies` | Observed-but-undeclared roles |
//! | GET | `/api/v1/instances` | List role instances |
//! | POST | `/api/v1/instances/{role}/{member}/reset` | Reset a Failed instance |
//! | GET | `/api/v1/routing` | Last applied routing record |
//! | GET | `/api/v1/queues/{queue}` | Queue depth |
//! | POST | `/api/v1/queues/{queue}/tasks` | Submit a task |
//! | POST | `/api/v1/queues/{queue}/claim` | Claim tasks |
//! | POST | `/api/v1/queues/{queue}/ack/{id}` | Acknowledge a task |
//! | POST | `/api/v1/queues/{queue}/nack/{id}` | Hand a task back |
//! | GET | `/healthz` | Controller liveness and leadership |

pub mod handlers;
pub mod queue_handlers;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use corral_coord::Leadership;
use corral_lifecycle::LifecycleManager;
use corral_placement::RoleAssigner;
use corral_proxy::ConfigGenerator;
use corral_queue::TaskQueue;
use corral_registry::NodeRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub node_id: String,
    pub leadership: Leadership,
    pub registry: Arc<NodeRegistry>,
    pub assigner: Arc<RoleAssigner>,
    pub lifecycle: Arc<LifecycleManager>,
    pub routing: Arc<ConfigGenerator>,
    pub queue: TaskQueue,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/topology",
            get(handlers::get_topology).post(handlers::submit_topology),
        )
        .route("/assignment", get(handlers::get_assignment))
        .route("/members", get(handlers::list_members))
        .route("/members/{id}", get(handlers::get_member))
        .route("/anomalies", get(handlers::list_anomalies))
        .route("/instances", get(handlers::list_instances))
        .route(
            "/instances/{role}/{member}/reset",
            post(handlers::reset_instance),
        )
        .route("/routing", get(handlers::get_routing))
        .route("/queues/{queue}", get(queue_handlers::queue_stats))
        .route("/queues/{queue}/tasks", post(queue_handlers::submit_task))
        .route("/queues/{queue}/claim", post(queue_handlers::claim_tasks))
        .route("/queues/{queue}/ack/{id}", post(queue_handlers::ack_task))
        .route("/queues/{queue}/nack/{id}", post(queue_handlers::nack_task));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
