//! Builder/admin REST endpoints under `/api`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::flow::model::Node;

pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/flows", get(list_flows).post(create_flow))
        .route("/api/flows/{id}", get(get_draft))
        .route("/api/flows/{id}/nodes", post(add_node))
        .route("/api/flows/{id}/nodes/{node_id}", put(update_node).delete(delete_node))
        .route("/api/flows/{id}/edges", post(add_edge))
        .route("/api/flows/{id}/edges/{sequence}", delete(delete_edge))
        .route("/api/flows/{id}/publish", post(publish))
        .route("/api/flows/{id}/graph", get(get_graph))
        .route("/api/flows/{id}/versions/{version}/mappings", get(get_mappings))
        .route("/api/flows/{id}/enable", post(enable_flow))
        .route("/api/flows/{id}/disable", post(disable_flow))
        .route("/api/flows/{id}/sessions", post(start_session))
        .route("/api/conversations/{id}/sessions", get(list_sessions))
        .with_state(state)
}

// ── Flows ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateFlow {
    account_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AccountFilter {
    account_id: Option<String>,
}

async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<CreateFlow>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state.engine.flows().create_flow(&body.account_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

async fn list_flows(
    State(state): State<AppState>,
    Query(filter): Query<AccountFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let flows = state.engine.flows().list_flows(filter.account_id.as_deref()).await?;
    Ok(Json(flows))
}

async fn get_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.flows().get_draft(id).await?))
}

// ── Draft editing ───────────────────────────────────────────────────────

async fn add_node(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(node): Json<Node>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state.engine.flows().add_node(id, node).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

async fn update_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(Uuid, String)>,
    Json(node): Json<Node>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.flows().update_node(id, &node_id, node).await?))
}

async fn delete_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.flows().delete_node(id, &node_id).await?))
}

#[derive(Debug, Deserialize)]
struct AddEdge {
    source: String,
    target: String,
    #[serde(default)]
    discriminator: Option<String>,
}

async fn add_edge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AddEdge>,
) -> Result<impl IntoResponse, ApiError> {
    let edge = state
        .engine
        .flows()
        .add_edge(id, &body.source, &body.target, body.discriminator.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(edge)))
}

async fn delete_edge(
    State(state): State<AppState>,
    Path((id, sequence)): Path<(Uuid, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.flows().delete_edge(id, sequence).await?))
}

// ── Publishing ──────────────────────────────────────────────────────────

async fn publish(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state.engine.flows().publish(id).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    version: Option<i64>,
}

/// GET /api/flows/{id}/graph: the current published graph, or `?version=N`.
async fn get_graph(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<VersionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.engine.flows().get_flow(id, query.version).await?;
    Ok(Json(json!({
        "flow_id": snapshot.flow_id,
        "version": snapshot.version,
        "graph": snapshot.graph,
        "mappings": snapshot.mappings,
    })))
}

async fn get_mappings(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.flows().field_mappings(id, version).await?))
}

async fn enable_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.flows().set_enabled(id, true).await?;
    Ok(Json(json!({"status": "enabled"})))
}

async fn disable_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.flows().set_enabled(id, false).await?;
    Ok(Json(json!({"status": "disabled"})))
}

// ── Sessions ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartSession {
    conversation_id: String,
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StartSession>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.engine.start_session(id, &body.conversation_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/conversations/{id}/sessions: newest first, with status and last error.
async fn list_sessions(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.sessions().list(&conversation_id).await?))
}
