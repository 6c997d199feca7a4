use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::models::{EnhancementRequest, NewEnhancement, RequestStatus};
use super::orchestrator::CycleRunner;
use super::queue::QueueHandle;
use super::suggest::Suggester;
use crate::errors::{CycleError, QueueError};

/// Header carrying the shared secret on `/api/*` calls.
pub const SECRET_HEADER: &str = "x-enhancer-secret";

// ── Shared application state ──────────────────────────────────────────

/// Defaults for `POST /api/autogen-enhancements` when the body omits them.
#[derive(Debug, Clone)]
pub struct SuggestDefaults {
    pub code_dir: PathBuf,
    pub include: String,
    pub max_files: usize,
}

pub struct AppState {
    pub queue: QueueHandle,
    pub runner: CycleRunner,
    /// `None` when no model credentials are configured
    pub suggester: Option<Suggester>,
    pub suggest_defaults: SuggestDefaults,
    pub secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct AutogenRequest {
    pub code_dir: Option<PathBuf>,
    pub max_files: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                format!("missing or invalid {} header", SECRET_HEADER),
            ),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation { .. } => ApiError::BadRequest(err.to_string()),
            QueueError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => {
                tracing::error!("queue error: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: &SharedState) -> Router<SharedState> {
    let api = Router::new()
        .route(
            "/api/enhancements",
            get(list_enhancements).post(create_enhancement),
        )
        .route("/api/enhancements/{id}/requeue", post(requeue_enhancement))
        .route("/api/trigger-enhancement-cycle", post(trigger_cycle))
        .route("/api/cycle", get(cycle_status))
        .route("/api/autogen-enhancements", post(autogen_enhancements))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(state),
            require_secret,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
}

/// Reject `/api/*` calls without the configured secret. With no secret
/// configured every call is let through.
async fn require_secret(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(secret) = state.secret.as_deref() {
        let provided = request
            .headers()
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(secret) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_enhancements(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(RequestStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let requests = state.queue.list(status).await?;
    Ok(Json(requests))
}

async fn create_enhancement(
    State(state): State<SharedState>,
    payload: Result<Json<NewEnhancement>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = state
        .queue
        .append(EnhancementRequest::from(payload))
        .await?;
    tracing::info!(id = %request.id, summary = %request.summary, "enhancement queued");
    Ok((StatusCode::CREATED, Json(request)))
}

async fn requeue_enhancement(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state.queue.requeue(id).await?;
    tracing::info!(id = %request.id, "enhancement requeued");
    Ok(Json(request))
}

async fn trigger_cycle(State(state): State<SharedState>) -> impl IntoResponse {
    match state.runner.trigger() {
        Ok(_handle) => (StatusCode::ACCEPTED, Json(json!({"status": "started"}))),
        Err(CycleError::AlreadyRunning) => {
            (StatusCode::CONFLICT, Json(json!({"status": "already_running"})))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

async fn cycle_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.runner.status())
}

async fn autogen_enhancements(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let suggester = state.suggester.as_ref().ok_or_else(|| {
        ApiError::Unavailable("suggestions need agent.api_key to be configured".into())
    })?;
    let req: AutogenRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AutogenRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let defaults = &state.suggest_defaults;
    let code_dir = req.code_dir.unwrap_or_else(|| defaults.code_dir.clone());
    let max_files = req.max_files.unwrap_or(defaults.max_files);
    let queued = suggester
        .suggest_and_enqueue(&code_dir, &defaults.include, max_files)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(json!({"queued": queued})))
}

// ── Tests ─────────────────────────────────────────────────────────────
