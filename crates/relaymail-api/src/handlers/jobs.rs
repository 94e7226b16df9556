//! Send job handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaymail_core::{CreateJobRequest, RetryAction};
use relaymail_storage::{JobStatus, SendJob, SCOPE_ADMIN};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{api_error, check_scope, job_error, ApiError};
use crate::auth::{AppState, AuthContext};

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Job list response
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub items: Vec<JobResponse>,
    pub total: i64,
}

/// Job counters
#[derive(Debug, Serialize)]
pub struct JobStatsResponse {
    pub total: i64,
    pub pending: i64,
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
}

/// Job response
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub status: String,
    pub servers: Vec<String>,
    pub strategy: String,
    pub dry_run_limit: Option<i32>,
    pub stats: JobStatsResponse,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SendJob> for JobResponse {
    fn from(j: SendJob) -> Self {
        Self {
            servers: j.servers_vec(),
            stats: JobStatsResponse {
                total: j.total,
                pending: j.pending,
                queued: j.queued,
                sent: j.sent,
                failed: j.failed,
            },
            id: j.id,
            campaign_id: j.campaign_id,
            status: j.status,
            strategy: j.strategy,
            dry_run_limit: j.dry_run_limit,
            scheduled_at: j.scheduled_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
            created_at: j.created_at,
            updated_at: j.updated_at,
        }
    }
}

/// Retry request body
#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub action: RetryAction,
}

/// List jobs
///
/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let status = match query.status.as_deref() {
        Some(s) => Some(s.parse::<JobStatus>().map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e)
        })?),
        None => None,
    };

    let limit = query.limit.clamp(1, 500);
    let page = state
        .jobs
        .list(status, limit, query.offset.max(0))
        .await
        .map_err(job_error)?;

    Ok(Json(JobListResponse {
        items: page.items.into_iter().map(JobResponse::from).collect(),
        total: page.total,
    }))
}

/// Create a job from a campaign
///
/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.create_job(input).await.map_err(job_error)?;
    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

/// Get a job with its stats
///
/// GET /api/v1/jobs/:id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.get(id).await.map_err(job_error)?;
    Ok(Json(JobResponse::from(job)))
}

/// POST /api/v1/jobs/:id/pause
pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.pause(id).await.map_err(job_error)?;
    Ok(Json(JobResponse::from(job)))
}

/// POST /api/v1/jobs/:id/resume
pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.resume(id).await.map_err(job_error)?;
    Ok(Json(JobResponse::from(job)))
}

/// POST /api/v1/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.cancel(id).await.map_err(job_error)?;
    Ok(Json(JobResponse::from(job)))
}

/// POST /api/v1/jobs/:id/retry
pub async fn retry_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(input): Json<RetryRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let job = state.jobs.retry(id, input.action).await.map_err(job_error)?;
    Ok(Json(JobResponse::from(job)))
}
