use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::errors::{ManifestError, OrchestratorError, PipelineError, SessionError};
use crate::evolution::EvolutionPipeline;
use crate::orchestrator::JobEngine;
use crate::sanitize::{reject_null_bytes, validate_relative_path};
use crate::session::SessionStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: JobEngine,
    pub pipeline: EvolutionPipeline,
    pub sessions: SessionStore,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub project_path: String,
}

#[derive(Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub job_id: String,
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub from_phase: Option<String>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Deserialize, Default)]
pub struct ResolveRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Deserialize)]
pub struct ArchiveRequest {
    pub max_age_secs: u64,
}

#[derive(Serialize)]
pub struct ArchiveResponse {
    pub archived: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    PreconditionFailed(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::PreconditionFailed(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let msg = err.to_string();
        match err {
            OrchestratorError::JobNotFound { .. }
            | OrchestratorError::EscalationNotFound { .. }
            | OrchestratorError::Manifest(ManifestError::NotFound { .. }) => {
                ApiError::NotFound(msg)
            }
            OrchestratorError::ProjectBusy { .. }
            | OrchestratorError::InvalidResume { .. }
            | OrchestratorError::EscalationOpen { .. } => ApiError::Conflict(msg),
            OrchestratorError::Manifest(_) | OrchestratorError::Security(_) => {
                ApiError::BadRequest(msg)
            }
            OrchestratorError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let msg = err.to_string();
        match err {
            PipelineError::ProjectNotFound { .. } => ApiError::NotFound(msg),
            PipelineError::EnvironmentNotConfigured { .. }
            | PipelineError::PreconditionFailed { .. } => ApiError::PreconditionFailed(msg),
            PipelineError::ProductionBusy | PipelineError::StaleBaseline { .. } => {
                ApiError::Conflict(msg)
            }
            PipelineError::Manifest(_) | PipelineError::Security(_) => ApiError::BadRequest(msg),
            PipelineError::Git(_) => ApiError::Internal(msg),
            PipelineError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let msg = err.to_string();
        match err {
            SessionError::NotFound { .. } => ApiError::NotFound(msg),
            SessionError::LockTimeout { .. } => ApiError::Conflict(msg),
            SessionError::Security(_) => ApiError::BadRequest(msg),
            SessionError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/execute", post(execute))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/jobs/{id}/resume", post(resume_job))
        .route("/stream/{id}", get(stream_job))
        .route("/escalations", get(list_escalations))
        .route(
            "/escalations/{job_id}/{phase_id}/resolve",
            post(resolve_escalation),
        )
        .route("/evolution/projects/{name}", get(evolution_status))
        .route("/evolution/projects/{name}/deploy", post(deploy))
        .route("/evolution/projects/{name}/validate", post(validate))
        .route("/evolution/projects/{name}/integrate", post(integrate))
        .route("/evolution/projects/{name}/rollback", post(rollback))
        .route("/sessions", post(open_session))
        .route("/sessions/archive", post(archive_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/messages", post(append_message))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Relative project paths resolve under the projects root; absolute ones are used as given.
fn resolve_project_path(state: &AppState, raw: &str) -> Result<PathBuf, ApiError> {
    reject_null_bytes("project path", raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    let rel = validate_relative_path("project path", raw)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(state.engine.config().server.projects_root.join(rel))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn execute(
    State(state): State<SharedState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let path = resolve_project_path(&state, &req.project_path)?;
    let job_id = state.engine.start(&path).await?;
    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse { job_id })))
}

async fn list_jobs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list()?))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.status(&id)?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.engine.cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn resume_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ResumeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let job = state
        .engine
        .resume(&id, req.from_phase.as_deref(), req.reset)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// One JSON event per line until `job_complete`.
async fn stream_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.engine.stream(&id)?;
    let lines = events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|e| {
            serde_json::json!({"type": "unknown", "error": e.to_string()}).to_string()
        });
        line.push('\n');
        Ok::<_, Infallible>(line)
    });
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    ))
}

async fn list_escalations(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.escalations()?))
}

async fn resolve_escalation(
    State(state): State<SharedState>,
    Path((job_id, phase_id)): Path<(String, String)>,
    body: Option<Json<ResolveRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(
        state
            .engine
            .resolve_escalation(&job_id, &phase_id, req.note)?,
    ))
}

async fn evolution_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.status(&name)?))
}

async fn deploy(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.deploy(&name).await?))
}

async fn validate(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.validate(&name).await?))
}

async fn integrate(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.integrate(&name).await?))
}

async fn rollback(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.rollback(&name).await?))
}

async fn open_session(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .sessions
        .get_or_create(req.correlation_id.as_deref(), &req.message)
        .await?;
    let status = if handle.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(handle)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.get(&id)?))
}

async fn append_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .sessions
            .append_message(&id, &req.role, &req.content)
            .await?,
    ))
}

async fn archive_sessions(
    State(state): State<SharedState>,
    Json(req): Json<ArchiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let archived = state
        .sessions
        .archive_expired(Duration::from_secs(req.max_age_secs))
        .await?;
    Ok(Json(ArchiveResponse { archived }))
}

// ── Tests ─────────────────────────────────────────────────────────────
