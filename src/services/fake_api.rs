//! In-process stand-in for the remote metrics API, used by the session and
//! gateway tests.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    logins: AtomicUsize,
    data_requests: AtomicUsize,
    reject_next: AtomicUsize,
    echo_first_page: AtomicBool,
    hosts: Mutex<Vec<Value>>,
    stats: Mutex<Vec<(String, Value)>>,
    failing_hosts: Mutex<HashSet<String>>,
    stats_queries: Mutex<Vec<HashMap<String, String>>>,
}

pub struct FakeMetricsApi {
    pub base_url: String,
    state: Arc<FakeState>,
}

impl FakeMetricsApi {
    pub const PASSWORD: &'static str = "secret";

    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/api/collections/users/auth-with-password", post(login))
            .route("/api/collections/systems/records", get(systems))
            .route("/api/collections/system_stats/records", get(system_stats))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn data_request_count(&self) -> usize {
        self.state.data_requests.load(Ordering::SeqCst)
    }

    /// The next `n` data requests answer 401 regardless of the token.
    pub fn reject_next(&self, n: usize) {
        self.state.reject_next.store(n, Ordering::SeqCst);
    }

    /// Host listings always report `page: 1`, whatever page was asked for.
    pub fn echo_first_page(&self) {
        self.state.echo_first_page.store(true, Ordering::SeqCst);
    }

    pub fn add_host(&self, id: &str, name: &str, status: &str, created: &str) {
        let mut hosts = self.state.hosts.lock();
        let address = format!("10.0.0.{}", hosts.len() + 1);
        hosts.push(json!({
            "id": id,
            "collectionId": "systems",
            "collectionName": "systems",
            "created": created,
            "updated": created,
            "name": name,
            "host": address,
            "port": "45876",
            "status": status,
            "users": [],
        }));
    }

    pub fn add_stats(&self, host_id: &str, stats: Value, created: &str) {
        let mut all = self.state.stats.lock();
        let record = json!({
            "id": format!("stat{}", all.len()),
            "collectionId": "system_stats",
            "collectionName": "system_stats",
            "created": created,
            "updated": created,
            "system": host_id,
            "type": "1m",
            "stats": stats,
        });
        all.push((host_id.to_string(), record));
    }

    pub fn fail_stats_for(&self, host_id: &str) {
        self.state.failing_hosts.lock().insert(host_id.to_string());
    }

    pub fn last_stats_query(&self) -> Option<HashMap<String, String>> {
        self.state.stats_queries.lock().last().cloned()
    }
}

#[derive(Deserialize)]
struct LoginBody {
    identity: String,
    password: String,
}

async fn login(State(state): State<Arc<FakeState>>, Json(body): Json<LoginBody>) -> Response {
    if body.password != FakeMetricsApi::PASSWORD {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": 400, "message": "Failed to authenticate." })),
        )
            .into_response();
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "token": format!("token-{}", n),
        "record": { "id": "u1", "email": body.identity },
    }))
    .into_response()
}

fn authorized(state: &FakeState, headers: &HeaderMap) -> bool {
    state.data_requests.fetch_add(1, Ordering::SeqCst);
    let pending = state.reject_next.load(Ordering::SeqCst);
    if pending > 0 {
        state.reject_next.store(pending - 1, Ordering::SeqCst);
        return false;
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer token-"))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": 401, "message": "The request requires valid record authorization token." })),
    )
        .into_response()
}

fn page_params(query: &HashMap<String, String>) -> (usize, usize) {
    let page = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1usize).max(1);
    let per_page = query.get("perPage").and_then(|p| p.parse().ok()).unwrap_or(30usize).max(1);
    (page, per_page)
}

async fn systems(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let mut hosts = state.hosts.lock().clone();
    hosts.sort_by(|a, b| b["created"].as_str().cmp(&a["created"].as_str()));

    let (page, per_page) = page_params(&query);
    let total = hosts.len();
    let total_pages = (total + per_page - 1) / per_page;
    let items: Vec<Value> = hosts.into_iter().skip((page - 1) * per_page).take(per_page).collect();

    let reported_page = if state.echo_first_page.load(Ordering::SeqCst) { 1 } else { page };

    Json(json!({
        "page": reported_page,
        "perPage": per_page,
        "totalItems": total,
        "totalPages": total_pages,
        "items": items,
    }))
    .into_response()
}

async fn system_stats(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    state.stats_queries.lock().push(query.clone());

    let filter = query.get("filter").cloned().unwrap_or_default();
    if state
        .failing_hosts
        .lock()
        .iter()
        .any(|host| filter.contains(&format!("\"{}\"", host)))
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "stats backend exploded").into_response();
    }

    let (_, per_page) = page_params(&query);
    let mut items: Vec<Value> = state
        .stats
        .lock()
        .iter()
        .filter(|(host, _)| filter.contains(&format!("system = \"{}\"", host)))
        .map(|(_, record)| record.clone())
        .collect();
    items.sort_by(|a, b| b["created"].as_str().cmp(&a["created"].as_str()));
    let total = items.len();
    items.truncate(per_page);

    Json(json!({
        "page": 1,
        "perPage": per_page,
        "totalItems": total,
        "totalPages": 1,
        "items": items,
    }))
    .into_response()
}
