//! Admin/tenant HTTP surface.
//!
//! Tenant operations authenticate with the bearer token issued at tenant
//! creation. Operators holding the admin secret can act on any tenant by
//! sending `x-admin-secret` plus `x-tenant-id`. Routing, auth, and shared
//! state live here; handlers live in the sibling modules.

pub mod error;
pub mod jobs;
pub mod schedule;
pub mod spreadsheets;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use crate::pipeline::PipelineExecutor;
use crate::scheduler::Scheduler;
use crate::store::{JobStore, Tenant, TenantStore};

use self::error::ApiError;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Tenant records.
    pub tenants: TenantStore,
    /// Job records.
    pub jobs: JobStore,
    /// Background pipeline runner.
    pub executor: Arc<PipelineExecutor>,
    /// Tick registry.
    pub scheduler: Arc<Scheduler>,
    /// Admin secret, when configured.
    pub admin_secret: Option<String>,
    /// Outstanding single-use download tokens.
    downloads: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl AppState {
    /// Assemble handler state.
    pub fn new(
        tenants: TenantStore,
        jobs: JobStore,
        executor: Arc<PipelineExecutor>,
        scheduler: Arc<Scheduler>,
        admin_secret: Option<String>,
    ) -> Self {
        Self {
            tenants,
            jobs,
            executor,
            scheduler,
            admin_secret,
            downloads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a single-use download token for a file path.
    pub fn grant_download(&self, token: String, path: PathBuf) {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, path);
    }

    /// Redeem (and consume) a download token.
    pub fn redeem_download(&self, token: &str) -> Option<PathBuf> {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }
}

/// Resolve the calling tenant from request headers.
///
/// Order: bearer token first; then the admin secret together with an
/// explicit `x-tenant-id`.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Tenant, ApiError> {
    if let Some(token) = bearer_token(headers) {
        return state
            .tenants
            .get_by_token(token)
            .await?
            .ok_or(ApiError::Unauthorized);
    }

    if let (Some(expected), Some(provided)) = (
        state.admin_secret.as_deref(),
        header_str(headers, "x-admin-secret"),
    ) {
        if constant_eq(expected, provided) {
            let tenant_id: i64 = header_str(headers, "x-tenant-id")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    ApiError::BadRequest("x-tenant-id header is required".to_owned())
                })?;
            return state
                .tenants
                .get(tenant_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("tenant {tenant_id}")));
        }
    }

    Err(ApiError::Unauthorized)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Length-constant string comparison for the admin secret.
fn constant_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", post(jobs::trigger_job).get(jobs::list_jobs))
        .route("/api/jobs/{query_id}", get(jobs::get_job))
        .route("/api/jobs/{query_id}/download", get(jobs::download_job_zip))
        .route("/api/spreadsheets/{kind}", get(spreadsheets::get_spreadsheet))
        .route("/files/{token}", get(spreadsheets::download_file))
        .route(
            "/api/schedule",
            get(schedule::get_schedule).put(schedule::set_schedule),
        )
        .route("/api/schedule/pause", post(schedule::pause_schedule))
        .route("/api/schedule/resume", post(schedule::resume_schedule))
        .with_state(state)
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// Bind and serve until the process is told to stop.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {listen_addr}: {e}"))?;
    info!(listen_addr, "admin API listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))
}
