//! HTTP surface: batch creation, status lookup and worker webhooks.
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::db::{self, BatchSnapshot, Pool};
use crate::dispatcher::Dispatcher;
use crate::ingress::{self, Ack, AudioEvent, IngressError, IngressEvent, UnitAck, UnitResult};
use crate::tracker::{self, BatchTicket, CreateBatchError, NewBatch};

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub dispatcher: Dispatcher,
    pub batch_timeout: chrono::Duration,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<IngressError> for ApiError {
    fn from(err: IngressError) -> Self {
        match err {
            IngressError::Malformed(msg) => ApiError::BadRequest(msg),
            e @ (IngressError::UnknownBatch(_) | IngressError::UnknownUnit(_)) => {
                ApiError::NotFound(e.to_string())
            }
            IngressError::Store(e) => ApiError::Internal(e),
        }
    }
}

impl From<CreateBatchError> for ApiError {
    fn from(err: CreateBatchError) -> Self {
        match err {
            e @ CreateBatchError::EmptyBatch => ApiError::BadRequest(e.to_string()),
            CreateBatchError::Store(e) => ApiError::Internal(e),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(err) => {
                error!(?err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_batch(
    State(state): State<AppState>,
    body: Result<Json<NewBatch>, JsonRejection>,
) -> Result<(StatusCode, Json<BatchTicket>), ApiError> {
    let Json(new) = body?;
    let ticket = tracker::create_batch(&state.pool, new, state.batch_timeout, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    db::fetch_snapshot(&state.pool, &batch_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown batch {}", batch_id)))
}

async fn summary_webhook(
    State(state): State<AppState>,
    body: Result<Json<UnitResult>, JsonRejection>,
) -> Result<Json<UnitAck>, ApiError> {
    let Json(ev) = body?;
    let ack = ingress::handle_unit_result(&state.pool, &state.dispatcher, ev).await?;
    Ok(Json(ack))
}

async fn audio_webhook(
    State(state): State<AppState>,
    body: Result<Json<AudioEvent>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(ev) = body?;
    let ack = ingress::handle_event(&state.pool, &state.dispatcher, ev.into()).await?;
    Ok(Json(ack))
}

async fn event_webhook(
    State(state): State<AppState>,
    body: Result<Json<IngressEvent>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(ev) = body?;
    let ack = ingress::handle_event(&state.pool, &state.dispatcher, ev).await?;
    Ok(Json(ack))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/batches", post(create_batch))
        .route("/batches/:batch_id", get(get_batch))
        .route("/webhooks/summary", post(summary_webhook))
        .route("/webhooks/audio", post(audio_webhook))
        .route("/webhooks/events", post(event_webhook))
        .with_state(state)
}
