use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::logging::redact_sensitive_text;
use crate::queue::{JobQueue, JobRecord, QueueStatus, SubmitError};
use crate::signing::{CallbackAllowlist, RequestSigner, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::SplitRequest;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    queue: JobQueue,
    signer: RequestSigner,
    allowlist: CallbackAllowlist,
}

impl AppState {
    pub fn new(queue: JobQueue, signer: RequestSigner, allowlist: CallbackAllowlist) -> Self {
        if allowlist.is_empty() {
            warn!("Webhook allowlist is empty; every job submission will be rejected");
        }
        Self {
            inner: Arc::new(AppStateInner {
                queue,
                signer,
                allowlist,
            }),
        }
    }

    pub fn from_config(config: &AppConfig, queue: JobQueue) -> Self {
        let signer = RequestSigner::new(&config.security.token).with_max_timestamp_skew(
            config
                .security
                .max_timestamp_skew_secs
                .map(Duration::from_secs),
        );
        let allowlist = CallbackAllowlist::new(&config.security.webhook_allowlist);
        Self::new(queue, signer, allowlist)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/queue/status", get(queue_status))
        .route("/split", post(submit_split))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.queue().status())
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

async fn submit_split(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubmitResponse>, AppError> {
    let payload = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("request body must be UTF-8".to_string()))?;
    verify_signature(&state, &headers, payload)?;

    let request: SplitRequest = serde_json::from_str(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {e}")))?;
    if !state.inner.allowlist.is_allowed(&request.callback_url) {
        warn!(
            callback_url = %redact_sensitive_text(&request.callback_url),
            "Rejected callback URL outside the allowlist"
        );
        return Err(AppError::BadRequest(
            "callback_url is not allowlisted".to_string(),
        ));
    }

    let descriptor = request.into_descriptor();
    let job_id = descriptor.job_id.clone();
    let model = descriptor.model_name.clone();
    let id = state.queue().submit(descriptor).map_err(|error| match error {
        SubmitError::Full => AppError::Unavailable(error.to_string()),
        SubmitError::Closed => AppError::Internal(error.to_string()),
    })?;

    info!(record_id = %id, job_id = %job_id, model = %model, "Job accepted");
    Ok(Json(SubmitResponse { job_id: id }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let record = parse_job_id(&id)
        .and_then(|uuid| state.queue().get(&uuid))
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    Ok(Json(record))
}

/// Cancellation is signed like submission, over an empty body.
async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    verify_signature(&state, &headers, "")?;
    let uuid = parse_job_id(&id).ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    if state.queue().get(&uuid).is_none() {
        return Err(AppError::NotFound(format!("job not found: {id}")));
    }
    if !state.queue().cancel(&uuid) {
        return Err(AppError::BadRequest(format!("job already finished: {id}")));
    }
    info!(record_id = %uuid, "Job cancellation requested");
    Ok(StatusCode::ACCEPTED)
}

fn parse_job_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

fn verify_signature(state: &AppState, headers: &HeaderMap, payload: &str) -> Result<(), AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let (Some(signature), Some(timestamp)) = (header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
    else {
        return Err(AppError::Unauthorized(format!(
            "missing {SIGNATURE_HEADER} or {TIMESTAMP_HEADER} header"
        )));
    };

    if state.inner.signer.verify(payload, timestamp, signature) {
        Ok(())
    } else {
        warn!("Rejected request with an invalid signature");
        Err(AppError::Unauthorized("invalid signature".to_string()))
    }
}

// ─── Error type ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
