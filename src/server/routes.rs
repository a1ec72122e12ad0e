//! Axum route handlers for the task store.
//!
//! # Routes
//!
//! - `GET    /health`                               — liveness probe
//! - `GET    /store/phase`                          — configured and effective phase
//! - `GET    /metrics`                              — collected router counters and gauges
//! - `POST   /task-states`                          — create
//! - `GET    /task-states`                          — list (filters, `limit`, `page`/`cursor`, `order_by`, `desc`)
//! - `POST   /task-states/batch`                    — batch create
//! - `GET    /task-states/by-key/:task_id/:agent_id` — lookup by natural key
//! - `GET|PUT|DELETE /task-states/:id`
//! - the same set under `/task-messages` (without `by-key`)
//!
//! Every route accepts a one-call phase override through the
//! `x-store-phase` header or the `store_phase` query parameter.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::entities::{TaskMessage, TaskState, TaskStateKey};
use crate::migration::{MigrationError, MigrationPhase, MigrationRouter};
use crate::store::{Entity, ListQuery, MemoryStore, OrderBy, Page, SortField, StoreError};
use crate::telemetry::Telemetry;

/// Header carrying a one-call phase override.
pub const PHASE_HEADER: &str = "x-store-phase";
/// Query parameter carrying a one-call phase override.
pub const PHASE_QUERY: &str = "store_phase";
/// Largest `limit` a list request may ask for.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub task_states: Arc<MigrationRouter<TaskState>>,
    pub task_messages: Arc<MigrationRouter<TaskMessage>>,
    pub telemetry: Arc<Telemetry>,
}

impl AppState {
    pub fn new(
        task_states: MigrationRouter<TaskState>,
        task_messages: MigrationRouter<TaskMessage>,
    ) -> Self {
        Self {
            task_states: Arc::new(task_states),
            task_messages: Arc::new(task_messages),
            telemetry: Arc::new(Telemetry::disabled()),
        }
    }

    /// Serve `GET /metrics` from this telemetry handle.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Both sides in process memory. Local development only.
    pub fn in_memory(phase: MigrationPhase) -> Self {
        Self::new(
            MigrationRouter::new(
                phase,
                Arc::new(MemoryStore::<TaskState>::new("legacy-memory")),
                Arc::new(MemoryStore::<TaskState>::new("target-memory")),
            ),
            MigrationRouter::new(
                phase,
                Arc::new(MemoryStore::<TaskMessage>::new("legacy-memory")),
                Arc::new(MemoryStore::<TaskMessage>::new("target-memory")),
            ),
        )
    }
}

/// Entities exposed over HTTP.
pub trait RoutedEntity: Entity {
    fn router(state: &AppState) -> &MigrationRouter<Self>;
}

impl RoutedEntity for TaskState {
    fn router(state: &AppState) -> &MigrationRouter<Self> {
        &state.task_states
    }
}

impl RoutedEntity for TaskMessage {
    fn router(state: &AppState) -> &MigrationRouter<Self> {
        &state.task_messages
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/store/phase", get(phase_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/task-states",
            post(create_handler::<TaskState>).get(list_handler::<TaskState>),
        )
        .route("/task-states/batch", post(batch_handler::<TaskState>))
        .route(
            "/task-states/by-key/:task_id/:agent_id",
            get(state_by_key_handler),
        )
        .route(
            "/task-states/:id",
            get(get_handler::<TaskState>)
                .put(update_handler::<TaskState>)
                .delete(delete_handler::<TaskState>),
        )
        .route(
            "/task-messages",
            post(create_handler::<TaskMessage>).get(list_handler::<TaskMessage>),
        )
        .route("/task-messages/batch", post(batch_handler::<TaskMessage>))
        .route(
            "/task-messages/:id",
            get(get_handler::<TaskMessage>)
                .put(update_handler::<TaskMessage>)
                .delete(delete_handler::<TaskMessage>),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Phase override extractor
// ---------------------------------------------------------------------------

/// Phase override requested by the caller, if any. The header wins over
/// the query parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOverride(pub Option<String>);

impl PhaseOverride {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for PhaseOverride {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(PHASE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let phase = header.or_else(|| {
            Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(mut params)| params.remove(PHASE_QUERY))
        });
        Ok(Self(phase))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("metrics collection failed: {0}")]
    Metrics(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Migration(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Migration(MigrationError::InvalidPhase { .. }) => StatusCode::BAD_REQUEST,
            Self::Migration(MigrationError::Store(err)) => match err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::DuplicateKey { .. } => StatusCode::CONFLICT,
                StoreError::InvalidCursor(_) | StoreError::MissingId { .. } => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "agent-control-plane",
    }))
}

/// GET /store/phase — the configured phase and the one this call resolves to.
async fn phase_handler(State(state): State<AppState>, phase: PhaseOverride) -> Json<Value> {
    let router = &state.task_states;
    Json(json!({
        "configured": router.phase(),
        "effective": router.resolve_phase(phase.as_deref()),
    }))
}

/// GET /metrics — current counters and gauges of both routers.
async fn metrics_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let points = state
        .telemetry
        .collect()
        .map_err(|err| ApiError::Metrics(err.to_string()))?;
    Ok(Json(json!({
        "enabled": state.telemetry.is_enabled(),
        "metrics": points,
    })))
}

async fn create_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Json(entity): Json<E>,
) -> Result<(StatusCode, Json<E>), ApiError> {
    let created = E::router(&state).create(entity, phase.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Path(id): Path<String>,
) -> Result<Json<E>, ApiError> {
    E::router(&state)
        .get(&id, phase.as_deref())
        .await?
        .map(Json)
        .ok_or_else(|| StoreError::not_found(E::KIND, id).into())
}

/// GET /task-states/by-key/:task_id/:agent_id
async fn state_by_key_handler(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Path((task_id, agent_id)): Path<(String, String)>,
) -> Result<Json<TaskState>, ApiError> {
    let key = TaskStateKey::new(task_id, agent_id);
    state
        .task_states
        .get_by_natural_key(&key, phase.as_deref())
        .await?
        .map(Json)
        .ok_or_else(|| StoreError::not_found(TaskState::KIND, key.to_string()).into())
}

async fn update_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Path(id): Path<String>,
    Json(mut entity): Json<E>,
) -> Result<Json<E>, ApiError> {
    entity.set_id(id);
    let updated = E::router(&state).update(entity, phase.as_deref()).await?;
    Ok(Json(updated))
}

async fn delete_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    E::router(&state).delete(&id, phase.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let query = list_query(params)?;
    let items = E::router(&state).list(&query, phase.as_deref()).await?;
    let next_cursor = query.next_cursor(items.len())?;
    Ok(Json(json!({
        "items": items,
        "next_cursor": next_cursor,
    })))
}

async fn batch_handler<E: RoutedEntity>(
    State(state): State<AppState>,
    phase: PhaseOverride,
    Json(entities): Json<Vec<E>>,
) -> Result<(StatusCode, Json<Vec<E>>), ApiError> {
    let created = E::router(&state)
        .batch_create(entities, phase.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Turn list query parameters into a [`ListQuery`]. Parameters that are not
/// paging or ordering controls become equality filters.
fn list_query(params: HashMap<String, String>) -> Result<ListQuery, ApiError> {
    let mut query = ListQuery::new();
    let mut descending = false;

    for (name, value) in params {
        match name.as_str() {
            PHASE_QUERY => {}
            "limit" => {
                let limit: usize = value
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid limit '{value}'")))?;
                query = query.limit(limit.clamp(1, MAX_PAGE_SIZE));
            }
            "page" => {
                let page: usize = value
                    .parse()
                    .ok()
                    .filter(|page| *page >= 1)
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid page '{value}'")))?;
                query = query.page(Page::Number(page));
            }
            "cursor" => query = query.page(Page::Cursor(value)),
            "order_by" => {
                let field = SortField::parse(&value)
                    .ok_or_else(|| ApiError::BadRequest(format!("cannot order by '{value}'")))?;
                query.order_by.field = field;
            }
            "desc" => descending = matches!(value.as_str(), "true" | "1"),
            _ => query = query.filter(name, value),
        }
    }

    let field = query.order_by.field;
    query = query.order_by(if descending {
        OrderBy::descending(field)
    } else {
        OrderBy::ascending(field)
    });
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::store::EntityStore;

    struct Harness {
        legacy: Arc<MemoryStore<TaskState>>,
        target: Arc<MemoryStore<TaskState>>,
        app: Router,
    }

    fn harness(phase: MigrationPhase) -> Harness {
        let legacy = Arc::new(MemoryStore::<TaskState>::new("legacy"));
        let target = Arc::new(MemoryStore::<TaskState>::new("target"));
        let states = MigrationRouter::new(phase, legacy.clone(), target.clone());
        let messages = MigrationRouter::new(
            phase,
            Arc::new(MemoryStore::<TaskMessage>::new("legacy")),
            Arc::new(MemoryStore::<TaskMessage>::new("target")),
        );
        Harness {
            legacy,
            target,
            app: app_router(AppState::new(states, messages)),
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let h = harness(MigrationPhase::Legacy);
        let (status, json) = send(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let h = harness(MigrationPhase::Legacy);
        let (status, created) = send(
            &h.app,
            post_json(
                "/task-states",
                json!({"task_id": "t1", "agent_id": "a1", "state": {"step": 1}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&h.app, get(&format!("/task-states/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["state"], json!({"step": 1}));
        assert!(h.target.is_empty());
    }

    #[tokio::test]
    async fn test_missing_is_404_and_duplicate_is_409() {
        let h = harness(MigrationPhase::Legacy);
        let (status, body) = send(&h.app, get("/task-states/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let body = json!({"task_id": "t1", "agent_id": "a1", "state": {}});
        send(&h.app, post_json("/task-states", body.clone())).await;
        let (status, _) = send(&h.app, post_json("/task-states", body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_header_override_routes_to_target_only() {
        let h = harness(MigrationPhase::DualWrite);
        let request = Request::builder()
            .method("POST")
            .uri("/task-states")
            .header("Content-Type", "application/json")
            .header(PHASE_HEADER, "target")
            .body(Body::from(
                json!({"task_id": "t1", "agent_id": "a1", "state": {}}).to_string(),
            ))
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(h.legacy.is_empty());
        assert_eq!(h.target.len(), 1);

        let (_, phase) = send(&h.app, get("/store/phase")).await;
        assert_eq!(phase["configured"], "dual_write");
        assert_eq!(phase["effective"], "dual_write");
    }

    #[tokio::test]
    async fn test_query_override_reads_target() {
        let h = harness(MigrationPhase::Legacy);
        let mut seeded = TaskState::new("t1", "a1", json!({}));
        seeded.id = Some("abc".into());
        h.legacy.create(seeded).await.unwrap();

        let (status, _) = send(&h.app, get("/task-states/abc")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&h.app, get("/task-states/abc?store_phase=target")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, phase) = send(&h.app, get("/store/phase?store_phase=dual_read")).await;
        assert_eq!(phase["effective"], "dual_read");
    }

    #[tokio::test]
    async fn test_dual_write_create_reaches_both_stores() {
        let h = harness(MigrationPhase::DualWrite);
        let (_, created) = send(
            &h.app,
            post_json(
                "/task-states",
                json!({"task_id": "t1", "agent_id": "a1", "state": {}}),
            ),
        )
        .await;
        let id = created["id"].as_str().unwrap();
        assert!(h.target.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let h = harness(MigrationPhase::Legacy);
        for agent in ["a1", "a2", "a3"] {
            send(
                &h.app,
                post_json(
                    "/task-states",
                    json!({"task_id": "t1", "agent_id": agent, "state": {}}),
                ),
            )
            .await;
        }
        send(
            &h.app,
            post_json(
                "/task-states",
                json!({"task_id": "t2", "agent_id": "a1", "state": {}}),
            ),
        )
        .await;

        let (status, page) = send(&h.app, get("/task-states?task_id=t1&limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"].as_array().unwrap().len(), 2);
        let cursor = page["next_cursor"].as_str().unwrap().to_string();

        let (_, rest) = send(
            &h.app,
            get(&format!("/task-states?task_id=t1&limit=2&cursor={cursor}")),
        )
        .await;
        assert_eq!(rest["items"].as_array().unwrap().len(), 1);
        assert!(rest["next_cursor"].is_null());
    }

    #[tokio::test]
    async fn test_bad_list_parameters_are_400() {
        let h = harness(MigrationPhase::Legacy);
        let (status, _) = send(&h.app, get("/task-states?cursor=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&h.app, get("/task-states?order_by=colour")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&h.app, get("/task-states?page=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&h.app, get("/task-states?page=184467440737095517")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_dual_read_matches() {
        let telemetry = Arc::new(Telemetry::enabled());
        let states = MigrationRouter::builder(
            Arc::new(MemoryStore::<TaskState>::new("legacy")),
            Arc::new(MemoryStore::<TaskState>::new("target")),
        )
        .phase(MigrationPhase::DualRead)
        .metrics(telemetry.metrics_sink())
        .build();
        let messages = MigrationRouter::new(
            MigrationPhase::Legacy,
            Arc::new(MemoryStore::<TaskMessage>::new("legacy")),
            Arc::new(MemoryStore::<TaskMessage>::new("target")),
        );
        let app = app_router(AppState::new(states, messages).with_telemetry(telemetry));

        let (_, created) = send(
            &app,
            post_json("/task-states", json!({"task_id": "t1", "agent_id": "a1"})),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();
        let (status, _) = send(&app, get(&format!("/task-states/{id}"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        let matched: Vec<&Value> = body["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|point| point["name"] == "store.dual_read.match")
            .collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0]["value"], 1);
        assert_eq!(matched[0]["attributes"]["operation"], "get");
        assert_eq!(matched[0]["attributes"]["entity"], "task_state");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_when_disabled() {
        let h = harness(MigrationPhase::DualRead);
        let (status, body) = send(&h.app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);
        assert_eq!(body["metrics"], json!([]));
    }

    #[tokio::test]
    async fn test_by_key_update_and_delete() {
        let h = harness(MigrationPhase::Legacy);
        send(
            &h.app,
            post_json(
                "/task-states",
                json!({"task_id": "t1", "agent_id": "a1", "state": {"n": 1}}),
            ),
        )
        .await;

        let (status, found) = send(&h.app, get("/task-states/by-key/t1/a1")).await;
        assert_eq!(status, StatusCode::OK);
        let id = found["id"].as_str().unwrap().to_string();

        let request = Request::builder()
            .method("PUT")
            .uri(format!("/task-states/{id}"))
            .header("Content-Type", "application/json")
            .body(Body::from(
                json!({"task_id": "t1", "agent_id": "a1", "state": {"n": 2}}).to_string(),
            ))
            .unwrap();
        let (status, updated) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["state"], json!({"n": 2}));

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/task-states/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&h.app, get("/task-states/by-key/t1/a1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_batch() {
        let h = harness(MigrationPhase::DualRead);
        let (status, created) = send(
            &h.app,
            post_json(
                "/task-messages/batch",
                json!([
                    {"task_id": "t1", "sender": "user", "content": "hello"},
                    {"task_id": "t1", "sender": "agent", "content": "hi", "agent_id": "a1"}
                ]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.as_array().unwrap().len(), 2);

        let (_, listed) = send(&h.app, get("/task-messages?task_id=t1")).await;
        assert_eq!(listed["items"].as_array().unwrap().len(), 2);
    }
}
