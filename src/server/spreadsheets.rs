//! Spreadsheet metadata and the token download path.
//!
//! `GET /api/spreadsheets/{kind}` answers with the file's name, size, and a
//! single-use download URL; `GET /files/{token}` serves the bytes without
//! tenant auth, which lets operators hand the link to spreadsheet tooling.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::{
    tenant_emodal_dir, JobArtifacts, ALL_APPOINTMENTS_SHEET, ALL_CONTAINERS_SHEET,
    FILTERED_CONTAINERS_SHEET,
};

use super::error::ApiError;
use super::jobs::fetch_owned_job;
use super::{authenticate, AppState};

/// Which spreadsheet the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadsheetKind {
    /// Master mirror of the latest container listing.
    LatestList,
    /// Master mirror of the latest appointment listing.
    LatestAppointments,
    /// One job's raw container listing.
    JobList,
    /// One job's filtered + enriched sheet.
    JobFiltered,
    /// One job's raw appointment listing.
    JobAppointments,
}

/// Query parameters for job-scoped kinds.
#[derive(Debug, Deserialize)]
pub struct SpreadsheetQuery {
    /// Required for the `job_*` kinds.
    pub query_id: Option<String>,
}

/// Metadata answer with a single-use download link.
#[derive(Debug, Serialize)]
pub struct SpreadsheetInfo {
    /// File name on disk.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Single-use download path.
    pub download_url: String,
}

/// `GET /api/spreadsheets/{kind}`.
pub async fn get_spreadsheet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<SpreadsheetKind>,
    Query(query): Query<SpreadsheetQuery>,
) -> Result<Json<SpreadsheetInfo>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;

    let path: PathBuf = match kind {
        SpreadsheetKind::LatestList => {
            tenant_emodal_dir(&tenant.root_path).join(ALL_CONTAINERS_SHEET)
        }
        SpreadsheetKind::LatestAppointments => {
            tenant_emodal_dir(&tenant.root_path).join(ALL_APPOINTMENTS_SHEET)
        }
        SpreadsheetKind::JobList | SpreadsheetKind::JobFiltered | SpreadsheetKind::JobAppointments => {
            let query_id = query
                .query_id
                .ok_or_else(|| ApiError::BadRequest("query_id is required".to_owned()))?;
            let job = fetch_owned_job(&state, &tenant, &query_id).await?;
            let artifacts = JobArtifacts::open(&tenant.root_path, &job.query_id);
            match kind {
                SpreadsheetKind::JobList => artifacts.dir().join(ALL_CONTAINERS_SHEET),
                SpreadsheetKind::JobFiltered => artifacts.dir().join(FILTERED_CONTAINERS_SHEET),
                _ => artifacts.dir().join(ALL_APPOINTMENTS_SHEET),
            }
        }
    };

    let metadata = std::fs::metadata(&path)
        .map_err(|_| ApiError::NotFound("spreadsheet not generated yet".to_owned()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let token = Uuid::new_v4().to_string();
    state.grant_download(token.clone(), path);

    Ok(Json(SpreadsheetInfo {
        filename,
        size: metadata.len(),
        download_url: format!("/files/{token}"),
    }))
}

/// `GET /files/{token}` — redeem a download token for the file bytes.
pub async fn download_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .redeem_download(&token)
        .ok_or_else(|| ApiError::NotFound("unknown or expired download token".to_owned()))?;

    let bytes =
        std::fs::read(&path).map_err(|_| ApiError::NotFound("file no longer exists".to_owned()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_owned());

    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_owned(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}
