//! HTTP surface for intake and delivery.
//!
//! Field naming here is underscored; the event bus uses camel case. The
//! translation happens in these DTOs and nowhere deeper.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::{StatusCode, request::Parts};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::delivery::{DeliveryGateway, ws_handler};
use crate::error::{ErrorCode, IntakeError};
use crate::intake::{AuthContext, IntakeService};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeService>,
    pub delivery: Arc<DeliveryGateway>,
}

/// Build the router with all intake and delivery routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", post(start_session).get(list_sessions))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/pause", post(pause_session))
        .route("/v1/sessions/{id}/resume", post(resume_session))
        .route("/v1/sessions/{id}/cancel", post(cancel_session))
        .route("/v1/sessions/{id}/messages", post(submit_message))
        .route("/v1/analyses", post(submit_analysis))
        .route("/v1/jobs/{id}", get(poll_job))
        .route("/v1/events/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Auth ---

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";
const TIER_HEADER: &str = "x-tier";

/// Identity headers are stamped by the authenticating gateway in front of
/// this service; token validation is not this crate's concern.
impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };

        match (header(TENANT_HEADER), header(USER_HEADER)) {
            (Some(tenant_id), Some(user_id)) => Ok(AuthContext {
                tenant_id,
                user_id,
                tier: header(TIER_HEADER),
            }),
            _ => Err(ApiError::unauthenticated()),
        }
    }
}

// --- DTOs ---

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    topic_id: String,
    max_turns: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SubmitMessageRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitAnalysisRequest {
    topic_id: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

/// Error envelope with the mapped status code.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                error: "missing identity headers".to_string(),
                error_code: "UNAUTHENTICATED",
                retry_after_ms: None,
            },
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(error: IntakeError) -> Self {
        let code = error.error_code();
        let status = match code {
            ErrorCode::JobValidationError | ErrorCode::ParameterValidation => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::SessionNotFound
            | ErrorCode::JobNotFound
            | ErrorCode::ConfigurationNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SessionAccessDenied => StatusCode::FORBIDDEN,
            ErrorCode::SessionNotActive
            | ErrorCode::SessionIdleTimeout
            | ErrorCode::SessionBusy
            | ErrorCode::MaxTurnsReached => StatusCode::CONFLICT,
            ErrorCode::LlmTimeout | ErrorCode::LlmError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                error_code: code.as_str(),
                retry_after_ms: code.retry_after_ms(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// --- Handlers ---

async fn health() -> &'static str {
    "ok"
}

async fn start_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<StartSessionRequest>,
) -> Result<Response, ApiError> {
    let view = state
        .intake
        .start_session(&auth, &req.topic_id, req.max_turns)
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    let views = state.intake.list_sessions(&auth).await?;
    Ok(Json(views).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state.intake.get_session(&auth, id).await?;
    Ok(Json(view).into_response())
}

async fn pause_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state.intake.pause_session(&auth, id).await?;
    Ok(Json(view).into_response())
}

async fn resume_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state.intake.resume_session(&auth, id).await?;
    Ok(Json(view).into_response())
}

async fn cancel_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state.intake.cancel_session(&auth, id).await?;
    Ok(Json(view).into_response())
}

/// Always asynchronous acceptance: 202 with a pending job reference. The
/// assistant message never rides this response.
async fn submit_message(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitMessageRequest>,
) -> Result<Response, ApiError> {
    let accepted = state.intake.submit_message(&auth, id, &req.message).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

async fn submit_analysis(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<SubmitAnalysisRequest>,
) -> Result<Response, ApiError> {
    let accepted = state
        .intake
        .submit_analysis(&auth, &req.topic_id, req.params)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// Polling fallback for clients without a socket: recommended cadence is to
/// start after 90 s of silence, poll every 5 s, and give up after 5 min.
async fn poll_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let projection = state.intake.poll_job(&auth, id).await?;
    Ok(Json(projection).into_response())
}
