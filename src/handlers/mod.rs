use crate::error::{AppError, AppResult};
use crate::models::metrics::{FleetSummary, Host, HostLoad, Sample};
use crate::models::node::{DirectoryNode, HostNodeInfo};
use crate::models::tags::{Alias, AliasRequest, Tag, TagLoadStatus, TagRef};
use crate::models::threshold::{Threshold, ThresholdValues};
use crate::services::aggregation::AggregationEngine;
use crate::services::batch::BatchLoadEvaluator;
use crate::services::directory::NodeDirectory;
use crate::services::tags::{AliasStore, TagStore};
use crate::services::threshold::ThresholdStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

const DEFAULT_SAMPLE_LIMIT: usize = 5;

// State
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AggregationEngine>,
    pub thresholds: Arc<ThresholdStore>,
    pub aliases: Arc<AliasStore>,
    pub tags: Arc<TagStore>,
    pub directory: Arc<NodeDirectory>,
    pub batch: Arc<BatchLoadEvaluator>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/systems", get(list_systems))
        .route("/api/systems/summary", get(fleet_summary))
        .route("/api/systems/stats", get(fleet_stats))
        .route("/api/systems/:id/stats", get(host_samples))
        .route("/api/systems/:id/status", get(host_status))
        .route(
            "/api/systems/:id/threshold",
            get(get_threshold).put(put_threshold).delete(delete_threshold),
        )
        .route("/api/thresholds", get(list_thresholds))
        .route(
            "/api/systems/:id/alias",
            get(get_alias).put(put_alias).delete(delete_alias),
        )
        .route("/api/aliases", get(list_aliases))
        .route(
            "/api/systems/:id/tags",
            get(list_tags).post(add_tag).delete(remove_tag),
        )
        .route("/api/systems/:id/nodes", get(host_nodes))
        .route("/api/nodes", get(all_nodes))
        .route("/api/nodes/search", get(search_nodes))
        .route("/api/nodes/high-load", get(high_load_nodes))
        .route("/api/nodes/load-status", post(resolve_load_statuses))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

// Routes
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_directory": state.directory.is_available(),
    }))
}

async fn list_systems(State(state): State<AppState>) -> AppResult<Json<Vec<Host>>> {
    Ok(Json(state.engine.list_hosts().await?))
}

async fn fleet_summary(State(state): State<AppState>) -> AppResult<Json<FleetSummary>> {
    Ok(Json(state.engine.summary().await?))
}

async fn fleet_stats(State(state): State<AppState>) -> AppResult<Json<Vec<HostLoad>>> {
    Ok(Json(state.engine.fleet_status().await?))
}

#[derive(Deserialize)]
struct SamplesQuery {
    limit: Option<i64>,
}

async fn host_samples(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SamplesQuery>,
) -> AppResult<Json<Vec<Sample>>> {
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit as usize,
        _ => DEFAULT_SAMPLE_LIMIT,
    };
    Ok(Json(state.engine.host_samples(&id, limit).await?))
}

async fn host_status(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<HostLoad>> {
    Ok(Json(state.engine.host_status(&id).await?))
}

async fn get_threshold(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Threshold>> {
    Ok(Json(state.thresholds.get_or_create_default(&id)?))
}

async fn put_threshold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(values): Json<ThresholdValues>,
) -> AppResult<Json<Threshold>> {
    Ok(Json(state.thresholds.upsert(&id, &values)?))
}

async fn delete_threshold(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    state.thresholds.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_thresholds(State(state): State<AppState>) -> Json<Vec<Threshold>> {
    Json(state.thresholds.list_all())
}

async fn get_alias(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Alias>> {
    state
        .aliases
        .get(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("alias for host {}", id)))
}

async fn put_alias(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AliasRequest>,
) -> AppResult<Json<Alias>> {
    Ok(Json(state.aliases.set(&id, &req.alias)?))
}

async fn delete_alias(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    state.aliases.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_aliases(State(state): State<AppState>) -> Json<Vec<Alias>> {
    Json(state.aliases.list_all())
}

async fn list_tags(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<Tag>> {
    Json(state.tags.list(&id))
}

async fn add_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(tag): Json<TagRef>,
) -> AppResult<impl IntoResponse> {
    let created = state.tags.add(&id, &tag)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn remove_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(tag): Json<TagRef>,
) -> AppResult<StatusCode> {
    state.tags.remove(&id, &tag)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn host_nodes(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<HostNodeInfo>> {
    Ok(Json(state.engine.host_node_info(&id).await?))
}

async fn all_nodes(State(state): State<AppState>) -> AppResult<Json<Vec<HostNodeInfo>>> {
    Ok(Json(state.engine.all_node_info().await?))
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    keyword: String,
}

async fn search_nodes(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> AppResult<Json<Value>> {
    let keyword = params.keyword.trim();
    if keyword.is_empty() {
        return Err(AppError::Validation("keyword must not be empty".to_string()));
    }

    let nodes: Vec<DirectoryNode> = state.engine.search_nodes(keyword).await?;
    Ok(Json(json!({
        "keyword": keyword,
        "nodes": nodes,
        "count": nodes.len(),
    })))
}

async fn high_load_nodes(State(state): State<AppState>) -> AppResult<Json<Vec<HostNodeInfo>>> {
    Ok(Json(state.engine.high_load_nodes().await?))
}

async fn resolve_load_statuses(
    State(state): State<AppState>,
    Json(requests): Json<Vec<TagRef>>,
) -> Json<Vec<TagLoadStatus>> {
    Json(state.batch.resolve_load_statuses(&requests).await)
}
