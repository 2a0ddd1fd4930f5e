use crate::buffer::AcceptResult;
use crate::store::MonitorStore;
use crate::supervisor::{
    ControlAction, RegisterRequest, RegisterResponse, StreamStatus, SupervisorHandle,
};
use crate::types::IncomingSample;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct HttpState {
    pub supervisor: SupervisorHandle,
    pub store: Arc<dyn MonitorStore>,
}

#[derive(Debug, Deserialize)]
struct SamplesRequest {
    samples: Vec<IncomingSample>,
}

#[derive(Debug, Deserialize, Default)]
struct CycleStartRequest {
    #[serde(default)]
    reference_cycle_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

const OK: OkResponse = OkResponse { ok: true };

type ApiError = (StatusCode, String);

// Stream lookups fail with 404, everything else on the supervisor path is a
// service problem.
fn map_err(err: anyhow::Error) -> ApiError {
    let msg = err.to_string();
    if msg.starts_with("unknown stream") || msg.starts_with("unknown cycle") {
        (StatusCode::NOT_FOUND, msg)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, msg)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_stream(
    State(state): State<HttpState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let response = state
        .supervisor
        .register(payload)
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn post_samples(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
    Json(payload): Json<SamplesRequest>,
) -> Result<Json<AcceptResult>, ApiError> {
    let result = state
        .supervisor
        .ingest(stream_id, payload.samples)
        .await
        .map_err(map_err)?;
    Ok(Json(result))
}

async fn cycle_start(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
    payload: Option<Json<CycleStartRequest>>,
) -> Result<Json<OkResponse>, ApiError> {
    let request = payload.map(|Json(p)| p).unwrap_or_default();
    state
        .supervisor
        .control(
            stream_id,
            ControlAction::CycleStart {
                reference_cycle_id: request.reference_cycle_id,
            },
        )
        .await
        .map_err(map_err)?;
    Ok(Json(OK))
}

async fn cycle_stop(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .supervisor
        .control(stream_id, ControlAction::CycleStop)
        .await
        .map_err(map_err)?;
    Ok(Json(OK))
}

async fn cycle_abort(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .supervisor
        .control(stream_id, ControlAction::ManualAbort)
        .await
        .map_err(map_err)?;
    Ok(Json(OK))
}

async fn cycle_ack(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .supervisor
        .control(stream_id, ControlAction::CompletionAck)
        .await
        .map_err(map_err)?;
    Ok(Json(OK))
}

async fn get_status(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<StreamStatus>, ApiError> {
    let status = state.supervisor.status(stream_id).await.map_err(map_err)?;
    Ok(Json(status))
}

async fn unregister_stream(
    State(state): State<HttpState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .supervisor
        .unregister(stream_id)
        .await
        .map_err(map_err)?;
    Ok(Json(OK))
}

async fn set_reference(
    State(state): State<HttpState>,
    Path(cycle_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    state.store.set_reference(cycle_id).await.map_err(map_err)?;
    Ok(Json(OK))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/streams", post(register_stream))
        .route("/v1/streams/{stream_id}/samples", post(post_samples))
        .route("/v1/streams/{stream_id}/cycle/start", post(cycle_start))
        .route("/v1/streams/{stream_id}/cycle/stop", post(cycle_stop))
        .route("/v1/streams/{stream_id}/cycle/abort", post(cycle_abort))
        .route("/v1/streams/{stream_id}/cycle/ack", post(cycle_ack))
        .route("/v1/streams/{stream_id}/status", get(get_status))
        .route("/v1/streams/{stream_id}", delete(unregister_stream))
        .route("/v1/cycles/{cycle_id}/reference", post(set_reference))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
