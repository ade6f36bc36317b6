//! Job endpoints: trigger, fetch, list, zip download.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::JobArtifacts;
use crate::store::{Job, JobStatus, Platform, SummaryStats, Tenant};

use super::error::ApiError;
use super::{authenticate, AppState};

/// Wire shape of a job record.
#[derive(Debug, Serialize)]
pub struct JobView {
    /// Query id, `q_{tenant}_{unix}`.
    pub query_id: String,
    /// Platform tag.
    pub platform: &'static str,
    /// Lifecycle status string.
    pub status: &'static str,
    /// When the run started, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason, when failed.
    pub error_message: Option<String>,
    /// Counters, when completed.
    pub summary_stats: Option<SummaryStats>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            query_id: job.query_id,
            platform: job.platform.as_str(),
            status: job.status.as_str(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message,
            summary_stats: job.summary_stats,
        }
    }
}

/// `POST /api/jobs` — create a pending job and start its run in the
/// background. Returns immediately.
pub async fn trigger_job(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let job = state.jobs.create(tenant.id, Platform::Emodal).await?;

    let executor = std::sync::Arc::clone(&state.executor);
    let query_id = job.query_id.clone();
    tokio::spawn(async move { executor.run(&query_id).await });

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "query_id": job.query_id,
            "status": job.status.as_str(),
        })),
    ))
}

/// `GET /api/jobs/{query_id}` — fetch one job.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(query_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let job = fetch_owned_job(&state, &tenant, &query_id).await?;
    Ok(Json(job.into()))
}

/// Filter and pagination for the job listing.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Optional status filter (`pending`, `in_progress`, `completed`, `failed`).
    pub status: Option<String>,
    /// Page size, capped at 200.
    pub limit: Option<u32>,
    /// Offset into the newest-first ordering.
    pub offset: Option<u32>,
}

/// `GET /api/jobs` — list the tenant's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let status = query
        .status
        .as_deref()
        .map(JobStatus::parse)
        .transpose()
        .map_err(|_| ApiError::BadRequest("unknown status filter".to_owned()))?;
    let limit = query.limit.unwrap_or(50).min(200);
    let offset = query.offset.unwrap_or(0);

    let jobs = state.jobs.list(tenant.id, status, limit, offset).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

/// `GET /api/jobs/{query_id}/download` — zip of the job directory.
pub async fn download_job_zip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(query_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let job = fetch_owned_job(&state, &tenant, &query_id).await?;

    let artifacts = JobArtifacts::open(&tenant.root_path, &job.query_id);
    if !artifacts.dir().is_dir() {
        return Err(ApiError::NotFound(format!("no artifacts for {query_id}")));
    }
    let bytes = artifacts.zip()?;

    let disposition = format!("attachment; filename=\"{query_id}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// Fetch a job and check it belongs to the authenticated tenant.
///
/// Foreign jobs read as not-found so query ids do not leak across tenants.
pub(super) async fn fetch_owned_job(
    state: &AppState,
    tenant: &Tenant,
    query_id: &str,
) -> Result<Job, ApiError> {
    let job = state
        .jobs
        .get(query_id)
        .await?
        .filter(|job| job.tenant_id == tenant.id)
        .ok_or_else(|| ApiError::NotFound(format!("job {query_id}")))?;
    Ok(job)
}
