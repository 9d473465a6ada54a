//! Request handlers for the submission surface (§4.6).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::app::SharedState;
use crate::config::ConfigOverlay;
use crate::envelope;
use crate::model::{Job, JobStatus, JobStatusUpdate, RepositorySpec};

pub type ApiResult<T> = Result<T, ApiError>;

/// The uniform error shape returned to clients, classified by kind rather
/// than by internal type name (§7).
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: err.to_string() }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub prompt: String,
    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,
    #[serde(default)]
    pub requested_tags: Vec<String>,
    #[serde(default)]
    pub target_node_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must be non-empty"));
    }
    for repo in &req.repositories {
        if repo.url.trim().is_empty() {
            return Err(ApiError::bad_request("repository url must be non-empty"));
        }
    }

    let job = Job::new_submission(req.prompt, req.target_node_id, req.requested_tags, req.repositories, req.metadata);
    state.store.upsert_job(&job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(State(state): State<SharedState>, Path(job_id): Path<Uuid>) -> ApiResult<Json<Job>> {
    state
        .store
        .get_job(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {job_id}")))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let jobs = state.store.list_jobs(limit, status).await?;
    Ok(Json(jobs))
}

#[derive(Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub async fn update_job_status(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<StatusUpdateRequest>,
) -> ApiResult<StatusCode> {
    let status = req
        .status
        .parse::<JobStatus>()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    if state.store.get_job(job_id).await?.is_none() {
        return Err(ApiError::not_found(format!("no job {job_id}")));
    }

    let update = JobStatusUpdate {
        status,
        log_path: req.log_path,
        result_summary: req.result_summary,
        error_message: req.error_message,
    };
    state.store.update_job_status(job_id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Operator escape hatch (§4.6): forces a job straight to FAILED, bypassing
/// `assign_job`'s acquire semantics since there is nothing left to acquire.
pub async fn force_fail_job(State(state): State<SharedState>, Path(job_id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.store.get_job(job_id).await?.is_none() {
        return Err(ApiError::not_found(format!("no job {job_id}")));
    }
    let update = JobStatusUpdate {
        status: JobStatus::Failed,
        error_message: Some("force-failed by operator".to_string()),
        ..Default::default()
    };
    state.store.update_job_status(job_id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
    pub after: Option<i64>,
}

pub async fn list_job_logs(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<crate::model::JobLogEntry>>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let entries = state.store.list_job_logs(job_id, limit, query.after).await?;
    Ok(Json(entries))
}

pub async fn list_nodes(State(state): State<SharedState>) -> ApiResult<Json<Vec<crate::model::NodeMetadata>>> {
    let nodes = state.store.list_nodes().await?;
    Ok(Json(nodes))
}

pub async fn get_config(State(state): State<SharedState>) -> Json<ConfigOverlay> {
    let config = state.config.read().await;
    Json(config.as_overlay_snapshot())
}

pub async fn post_config(State(state): State<SharedState>, Json(overlay): Json<ConfigOverlay>) -> StatusCode {
    let mut config = state.config.write().await;
    config.apply_overlay(&overlay);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub text: String,
}

pub async fn broadcast(State(state): State<SharedState>, Json(req): Json<BroadcastRequest>) -> StatusCode {
    state.registry.broadcast_except(None, envelope::chat_message("master", &req.text)).await;
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct SendRequest {
    pub node_id: Uuid,
    pub text: String,
}

pub async fn send(State(state): State<SharedState>, Json(req): Json<SendRequest>) -> ApiResult<StatusCode> {
    let delivered = state
        .registry
        .send_to(req.node_id, envelope::chat_message("master", &req.text))
        .await;
    if delivered {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("no connected node {}", req.node_id)))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
