//! HTTP client API for the key-value store
//!
//! Provides HTTP endpoints for external clients:
//! - Read keys from the local replica
//! - Write and delete keys through the leader
//! - Report health and leadership

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::core::node::{KvNode, WriteOutcome};
use crate::replication::NodeId;
use crate::state_machine::Command;

/// Shared state for the client HTTP server
pub type SharedNode = Arc<KvNode>;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Key and optional value; a null or missing value on write means delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Request body for `PUT /key/:key`; a null or missing value deletes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub value: Option<String>,
}

/// Response from a successful read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub value: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<NodeId>,
}

/// Response for leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    /// This node's ID
    pub node_id: NodeId,
    /// Whether this node is the leader
    pub is_leader: bool,
    /// Current leader ID if known
    pub leader_id: Option<NodeId>,
}

/// Response for health query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: NodeId,
    pub status: String,
    pub last_applied: u64,
}

/// Create an axum router for the client HTTP API
pub fn create_client_router(node: SharedNode) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/leader", get(handle_leader))
        .route("/key", post(handle_post))
        .route(
            "/key/:key",
            get(handle_get).put(handle_put).delete(handle_delete),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            leader_hint: None,
        }),
    )
}

fn not_current() -> ApiError {
    error(StatusCode::SERVICE_UNAVAILABLE, "Replica state is not current")
}

fn bad_request(rejection: JsonRejection) -> ApiError {
    debug!(error = %rejection, "rejecting request body");
    error(StatusCode::BAD_REQUEST, "Invalid request body")
}

/// Map a failed write to its HTTP response; `None` when the write committed
fn write_error(outcome: WriteOutcome) -> Option<ApiError> {
    match outcome {
        WriteOutcome::Committed { .. } => None,
        WriteOutcome::NotLeader { leader_hint } => Some((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Not the leader".to_string(),
                leader_hint,
            }),
        )),
        WriteOutcome::Timeout => Some(error(
            StatusCode::GATEWAY_TIMEOUT,
            "Timed out waiting for commit",
        )),
        WriteOutcome::InternalError(reason) => Some(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error: {}", reason),
        )),
    }
}

async fn write(node: &KvNode, command: Command) -> Result<(), ApiError> {
    match write_error(node.write(command).await) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Handle GET /health
pub async fn handle_health(
    State(node): State<SharedNode>,
) -> (StatusCode, Json<HealthResponse>) {
    let (status, label) = if node.is_current() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale")
    };
    (
        status,
        Json(HealthResponse {
            node_id: node.id(),
            status: label.to_string(),
            last_applied: node.last_applied(),
        }),
    )
}

/// Handle GET /leader - succeeds only on the leader, so load balancers can route writes
pub async fn handle_leader(
    State(node): State<SharedNode>,
) -> Result<Json<LeaderResponse>, ApiError> {
    if !node.is_leader() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Not the leader".to_string(),
                leader_hint: node.leader_hint(),
            }),
        ));
    }
    Ok(Json(LeaderResponse {
        node_id: node.id(),
        is_leader: true,
        leader_id: node.leader_hint(),
    }))
}

/// Handle GET /key/:key - local read, may be stale on followers
pub async fn handle_get(
    State(node): State<SharedNode>,
    Path(key): Path<String>,
) -> Result<Json<ReadResponse>, ApiError> {
    if !node.is_current() {
        return Err(not_current());
    }
    match node.get(&key) {
        Some(value) => Ok(Json(ReadResponse { key, value })),
        None => Err(error(StatusCode::NOT_FOUND, "Key not found")),
    }
}

fn upsert_or_delete(key: &str, value: Option<&str>) -> Command {
    match value {
        Some(value) => Command::put(key, value),
        None => Command::delete(key),
    }
}

/// Handle POST /key - upsert, or delete when the value is null
pub async fn handle_post(
    State(node): State<SharedNode>,
    body: Result<Json<KeyValue>, JsonRejection>,
) -> Result<Json<KeyValue>, ApiError> {
    let Json(request) = body.map_err(bad_request)?;
    write(&node, upsert_or_delete(&request.key, request.value.as_deref())).await?;
    Ok(Json(request))
}

/// Handle PUT /key/:key - upsert, or delete when the value is null
pub async fn handle_put(
    State(node): State<SharedNode>,
    Path(key): Path<String>,
    body: Result<Json<PutRequest>, JsonRejection>,
) -> Result<Json<KeyValue>, ApiError> {
    let Json(request) = body.map_err(bad_request)?;
    write(&node, upsert_or_delete(&key, request.value.as_deref())).await?;
    Ok(Json(KeyValue {
        key,
        value: request.value,
    }))
}

/// Handle DELETE /key/:key
pub async fn handle_delete(
    State(node): State<SharedNode>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    write(&node, Command::delete(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}
