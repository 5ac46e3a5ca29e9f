//! Node API Server
//!
//! HTTP API for the presentation layer: read the shared record and the mesh
//! state, and submit local edits, which the node merges and broadcasts.

use crate::domain::entities::{ChatMessage, SharedDocument, UserRecord, WorkRecord};
use crate::domain::identity::NodeId;
use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::{ErrorReport, MeshNode};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Request to add a known peer, by id or by the identity it derives from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeerRequest {
    #[serde(default)]
    pub id: Option<NodeId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub is_typing: bool,
}

/// Health response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node: NodeId,
    pub connected_peers: usize,
    pub session_invalidated: bool,
}

/// Full local replica.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub document: SharedDocument,
    pub works: Vec<WorkRecord>,
}

/// API Server state.
#[derive(Clone)]
pub struct ApiState {
    pub node: MeshNode,
}

impl ApiState {
    pub fn new(node: MeshNode) -> Self {
        Self { node }
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/state", get(state_handler))
        .route("/api/v1/network", get(network_handler))
        .route("/api/v1/peers", post(add_peer_handler))
        .route("/api/v1/peers/discover", post(discover_handler))
        .route("/api/v1/peers/:id", delete(remove_peer_handler))
        .route("/api/v1/messages", post(message_handler))
        .route("/api/v1/messages/:id/response", post(response_handler))
        .route("/api/v1/errors", post(error_handler))
        .route("/api/v1/errors/:id/resolve", post(resolve_handler))
        .route("/api/v1/typing", post(typing_handler))
        .route("/api/v1/work", put(work_handler))
        .route("/api/v1/works", post(publish_work_handler))
        .route("/api/v1/users", post(add_user_handler).put(update_user_handler))
        .route("/api/v1/users/:email", delete(remove_user_handler))
        .route("/api/v1/sync", post(sync_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API Server for a mesh node.
pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: String, node: MeshNode) -> Self {
        Self {
            listen_addr,
            state: ApiState::new(node),
        }
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!(addr = %self.listen_addr, "node API listening");

        let _guard = shutdown.task_guard();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.node.network_stats().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: stats.local_id,
        connected_peers: stats.connected_count,
        session_invalidated: state.node.is_session_invalidated(),
    })
}

async fn state_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(StateResponse {
        document: state.node.snapshot(),
        works: state.node.works(),
    })
}

async fn network_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.network_stats().await)
}

async fn add_peer_handler(
    State(state): State<ApiState>,
    Json(req): Json<AddPeerRequest>,
) -> impl IntoResponse {
    let id = match (req.id, req.email.as_deref()) {
        (Some(id), _) => id,
        (None, Some(email)) => state.node.peer_id_for(email),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "id or email required" })),
            )
        }
    };
    let name = req.display_name.or(req.email).unwrap_or_default();
    let added = state.node.add_known_peer(id.clone(), name).await;
    (StatusCode::CREATED, Json(json!({ "id": id, "added": added })))
}

async fn remove_peer_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.node.remove_known_peer(&NodeId::new(id.clone())).await {
        (StatusCode::OK, Json(json!({ "id": id, "removed": true })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "id": id, "error": "peer not known" })),
        )
    }
}

async fn discover_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let discovered = state.node.discover_from_users().await;
    Json(json!({ "discovered": discovered }))
}

async fn message_handler(
    State(state): State<ApiState>,
    Json(message): Json<ChatMessage>,
) -> impl IntoResponse {
    let message = state.node.send_message(message).await;
    (StatusCode::CREATED, Json(message))
}

async fn response_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(response): Json<Value>,
) -> impl IntoResponse {
    let recorded = state.node.respond_to_message(&id, response).await;
    let status = if recorded { StatusCode::CREATED } else { StatusCode::CONFLICT };
    (status, Json(json!({ "id": id, "recorded": recorded })))
}

async fn error_handler(
    State(state): State<ApiState>,
    Json(report): Json<ErrorReport>,
) -> impl IntoResponse {
    if report.field_id.is_none() && report.element_id.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "fieldId or elementId required" })),
        );
    }
    let accepted = state.node.report_error(report).await;
    (StatusCode::CREATED, Json(json!({ "accepted": accepted })))
}

async fn resolve_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let changed = state.node.resolve_error(&id).await;
    Json(json!({ "id": id, "resolved": true, "changed": changed }))
}

async fn typing_handler(
    State(state): State<ApiState>,
    Json(req): Json<TypingRequest>,
) -> impl IntoResponse {
    let sent = state.node.set_typing(req.is_typing).await;
    Json(json!({ "sent": sent }))
}

async fn work_handler(
    State(state): State<ApiState>,
    Json(fields): Json<Map<String, Value>>,
) -> impl IntoResponse {
    Json(state.node.update_work(fields).await)
}

async fn publish_work_handler(
    State(state): State<ApiState>,
    Json(work): Json<WorkRecord>,
) -> impl IntoResponse {
    if work.code.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "codigo required" })),
        );
    }
    let work = state.node.publish_work(work).await;
    (StatusCode::CREATED, Json(json!(work)))
}

async fn add_user_handler(
    State(state): State<ApiState>,
    Json(user): Json<UserRecord>,
) -> impl IntoResponse {
    save_user(&state, user, true).await
}

async fn update_user_handler(
    State(state): State<ApiState>,
    Json(user): Json<UserRecord>,
) -> impl IntoResponse {
    save_user(&state, user, false).await
}

async fn save_user(state: &ApiState, user: UserRecord, create: bool) -> (StatusCode, Json<Value>) {
    if user.email.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "email required" })),
        );
    }
    let email = user.key();
    let accepted = if create {
        state.node.add_user(user).await
    } else {
        state.node.update_user(user).await
    };
    match (accepted, create) {
        (true, true) => (StatusCode::CREATED, Json(json!({ "email": email }))),
        (true, false) => (StatusCode::OK, Json(json!({ "email": email }))),
        (false, _) => (
            StatusCode::CONFLICT,
            Json(json!({ "email": email, "error": "user not changed" })),
        ),
    }
}

async fn remove_user_handler(
    State(state): State<ApiState>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    if state.node.remove_user(&email).await {
        (StatusCode::OK, Json(json!({ "email": email, "removed": true })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "email": email, "error": "user not found" })),
        )
    }
}

async fn sync_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let pushed = state.node.broadcast_state().await;
    let requested = state.node.request_sync().await;
    state.node.request_users_sync().await;
    Json(json!({ "pushed": pushed, "requested": requested }))
}
