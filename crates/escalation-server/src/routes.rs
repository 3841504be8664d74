//! HTTP routes
//!
//! ```text
//! POST /trigger              start an escalation          202 {instanceId}
//! POST /acknowledge          stop one                     202 {outcome}
//! POST /dispatch-results     async delivery callback      202
//! GET  /instances[/:id]      live + archived snapshots
//! GET  /instances/:id/events recorded lifecycle events
//! GET  /chains/:id/events    events of every instance on a chain
//! GET  /events[?limit=N]     most recent events
//! GET  /events/stats         aggregate counts over the history
//! /chains, /chains/:id       admin CRUD (either document schema in, stages out)
//! /methods, /methods/:id     delivery method directory
//! GET  /healthz
//! ```

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use coordination::{
    AckOutcome, ChainDocument, ConfigurationError, DeliveryMethod, DispatchReport, EngineError,
    EscalationEvent, EventStats, NotificationInstance, SharedCoordinator, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub fn router(coordinator: SharedCoordinator) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/trigger", post(trigger))
        .route("/acknowledge", post(acknowledge))
        .route("/dispatch-results", post(dispatch_result))
        .route("/instances", get(list_instances))
        .route("/instances/:id", get(get_instance))
        .route("/instances/:id/events", get(instance_events))
        .route("/chains", get(list_chains).post(create_chain))
        .route(
            "/chains/:id",
            get(get_chain).put(update_chain).delete(delete_chain),
        )
        .route("/chains/:id/enable", post(enable_chain))
        .route("/chains/:id/disable", post(disable_chain))
        .route("/chains/:id/events", get(chain_events))
        .route("/events", get(recent_events))
        .route("/events/stats", get(event_stats))
        .route("/methods", get(list_methods))
        .route("/methods/:id", put(put_method))
        .with_state(coordinator)
}

/// Engine error rendered as `{ code, message }`
#[derive(Debug)]
pub struct ApiError(EngineError);

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl<E: Into<EngineError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InstanceNotFound(_)
            | EngineError::Configuration(ConfigurationError::ChainNotFound { .. })
            | EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::InstanceTerminated { .. }
            | EngineError::Configuration(ConfigurationError::ChainDisabled { .. })
            | EngineError::Store(StoreError::AlreadyExists(_)) => StatusCode::CONFLICT,
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), "Request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    chain_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    instance_id: String,
    #[serde(default)]
    acknowledged_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AcknowledgeResponse {
    outcome: AckOutcome,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResultRequest {
    instance_id: String,
    #[serde(flatten)]
    report: DispatchReport,
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    100
}

async fn healthz(State(coordinator): State<SharedCoordinator>) -> Json<serde_json::Value> {
    let status = if coordinator.is_shutting_down() {
        "stopping"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "live": coordinator.live_count(),
    }))
}

async fn trigger(
    State(coordinator): State<SharedCoordinator>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let instance_id = coordinator.trigger(&request.chain_id, request.payload)?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { instance_id })))
}

async fn acknowledge(
    State(coordinator): State<SharedCoordinator>,
    Json(request): Json<AcknowledgeRequest>,
) -> ApiResult<(StatusCode, Json<AcknowledgeResponse>)> {
    let outcome = coordinator
        .acknowledge(&request.instance_id, request.acknowledged_by)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(AcknowledgeResponse { outcome })))
}

async fn dispatch_result(
    State(coordinator): State<SharedCoordinator>,
    Json(request): Json<DispatchResultRequest>,
) -> ApiResult<StatusCode> {
    coordinator.on_dispatch_result(&request.instance_id, request.report)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_instances(
    State(coordinator): State<SharedCoordinator>,
) -> Json<Vec<NotificationInstance>> {
    Json(coordinator.instances())
}

async fn get_instance(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotificationInstance>> {
    Ok(Json(coordinator.instance(&id)?))
}

async fn instance_events(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<EscalationEvent>>> {
    let events = coordinator.history().get_instance_events(&id);
    if events.is_empty() {
        coordinator.instance(&id)?;
    }
    Ok(Json(events))
}

async fn chain_events(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> Json<Vec<EscalationEvent>> {
    Json(coordinator.history().get_chain_events(&id))
}

async fn recent_events(
    State(coordinator): State<SharedCoordinator>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<EscalationEvent>> {
    Json(coordinator.history().recent(query.limit))
}

async fn event_stats(State(coordinator): State<SharedCoordinator>) -> Json<EventStats> {
    Json(coordinator.history().get_stats())
}

async fn list_chains(
    State(coordinator): State<SharedCoordinator>,
) -> ApiResult<Json<Vec<ChainDocument>>> {
    let chains = coordinator.chains().list()?;
    Ok(Json(chains.iter().map(ChainDocument::from).collect()))
}

async fn create_chain(
    State(coordinator): State<SharedCoordinator>,
    Json(document): Json<ChainDocument>,
) -> ApiResult<(StatusCode, Json<ChainDocument>)> {
    let chain = document.normalize()?;
    coordinator.chains().create(chain.clone())?;
    info!(chain_id = %chain.id, stages = chain.stages.len(), "Chain created via API");
    Ok((StatusCode::CREATED, Json(ChainDocument::from(&chain))))
}

async fn get_chain(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChainDocument>> {
    let chain = coordinator
        .chains()
        .get(&id)?
        .ok_or(StoreError::NotFound(id))?;
    Ok(Json(ChainDocument::from(&chain)))
}

async fn update_chain(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
    Json(mut document): Json<ChainDocument>,
) -> ApiResult<Json<ChainDocument>> {
    document.id = id.clone();
    let chain = document.normalize()?;
    coordinator.chains().update(&id, chain.clone())?;
    info!(chain_id = %id, "Chain updated via API");
    Ok(Json(ChainDocument::from(&chain)))
}

async fn delete_chain(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    coordinator.chains().delete(&id)?;
    info!(chain_id = %id, "Chain deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_chain(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    coordinator.chains().enable(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_chain(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    coordinator.chains().disable(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_methods(
    State(coordinator): State<SharedCoordinator>,
) -> ApiResult<Json<Vec<DeliveryMethod>>> {
    Ok(Json(coordinator.methods().list()?))
}

async fn put_method(
    State(coordinator): State<SharedCoordinator>,
    Path(id): Path<String>,
    Json(mut method): Json<DeliveryMethod>,
) -> ApiResult<Json<DeliveryMethod>> {
    method.id = id;
    coordinator.methods().put(method.clone())?;
    Ok(Json(method))
}
