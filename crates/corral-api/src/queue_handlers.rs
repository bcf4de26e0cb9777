//! REST API handlers for the task queue bridge.
//!
//! Any controller accepts work; the queue is not leader-gated.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use corral_queue::QueueError;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

fn queue_status(e: &QueueError) -> StatusCode {
    match e {
        QueueError::InvalidQueue(_) | QueueError::Codec(_) => StatusCode::BAD_REQUEST,
        QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
        QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(serde::Serialize)]
pub struct Submitted {
    pub id: Uuid,
    pub queue: String,
}

/// POST /api/v1/queues/{queue}/tasks
///
/// The request body is the task payload, stored as-is.
pub async fn submit_task(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.queue.enqueue_raw(&queue, payload).await {
        Ok(id) => (StatusCode::ACCEPTED, ApiResponse::ok(Submitted { id, queue })).into_response(),
        Err(e) => error_response(&e.to_string(), queue_status(&e)).into_response(),
    }
}

/// Claim request body.
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    #[serde(default = "default_claim")]
    pub max: usize,
}

fn default_claim() -> usize {
    1
}

/// POST /api/v1/queues/{queue}/claim
pub async fn claim_tasks(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> impl IntoResponse {
    if req.max == 0 || req.max > 100 {
        return error_response("max must be between 1 and 100", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match state.queue.claim(&queue, req.max).await {
        Ok(tasks) => ApiResponse::ok(tasks).into_response(),
        Err(e) => error_response(&e.to_string(), queue_status(&e)).into_response(),
    }
}

/// POST /api/v1/queues/{queue}/ack/{id}
pub async fn ack_task(
    State(state): State<ApiState>,
    Path((queue, id)): Path<(String, Uuid)>,
) -> impl IntoResponse {
    match state.queue.ack(&queue, id).await {
        Ok(()) => ApiResponse::ok("acked").into_response(),
        Err(e) => error_response(&e.to_string(), queue_status(&e)).into_response(),
    }
}

/// Nack request body: the delivery attempt the consumer saw.
#[derive(Debug, Deserialize)]
pub struct NackRequest {
    pub attempt: u32,
}

/// POST /api/v1/queues/{queue}/nack/{id}
pub async fn nack_task(
    State(state): State<ApiState>,
    Path((queue, id)): Path<(String, Uuid)>,
    Json(req): Json<NackRequest>,
) -> impl IntoResponse {
    match state.queue.nack(&queue, id, req.attempt).await {
        Ok(()) => ApiResponse::ok("nacked").into_response(),
        Err(e) => error_response(&e.to_string(), queue_status(&e)).into_response(),
    }
}

/// GET /api/v1/queues/{queue}
pub async fn queue_stats(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
) -> impl IntoResponse {
    match state.queue.stats(&queue).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => error_response(&e.to_string(), queue_status(&e)).into_response(),
    }
}
