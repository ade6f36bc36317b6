//! Handler-level tests: handlers are plain async functions, so they are
//! exercised directly with extracted state and headers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

use quayside::artifacts::{write_master_mirror, ALL_CONTAINERS_SHEET};
use quayside::scheduler::Scheduler;
use quayside::server::jobs::{self, ListJobsQuery};
use quayside::server::schedule::{self, SetScheduleRequest};
use quayside::server::spreadsheets::{self, SpreadsheetKind, SpreadsheetQuery};
use quayside::server::AppState;
use quayside::store::JobStatus;

use crate::common::{self, install_sheets, sheet, CONTAINER_HEADERS, TENANT_ID};

struct Api {
    state: AppState,
    harness: common::Harness,
}

async fn api() -> Api {
    let harness = common::harness().await;
    let scheduler = Scheduler::new(
        harness.tenants.clone(),
        harness.jobs.clone(),
        Arc::clone(&harness.executor),
    );
    let state = AppState::new(
        harness.tenants.clone(),
        harness.jobs.clone(),
        Arc::clone(&harness.executor),
        scheduler,
        Some("admin-secret".to_owned()),
    );
    Api { state, harness }
}

fn tenant_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer tok-acme".parse().expect("header"));
    headers
}

fn admin_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-admin-secret", "admin-secret".parse().expect("header"));
    headers.insert("x-tenant-id", TENANT_ID.to_string().parse().expect("header"));
    headers
}

#[tokio::test]
async fn requests_without_credentials_are_unauthorized() {
    let api = api().await;
    let response = jobs::list_jobs(
        State(api.state.clone()),
        HeaderMap::new(),
        Query(ListJobsQuery {
            status: None,
            limit: None,
            offset: None,
        }),
    )
    .await;
    let response = response.expect_err("should be rejected").into_response();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn trigger_creates_a_pending_job_and_returns_immediately() {
    let api = api().await;
    install_sheets(
        &api.harness,
        sheet(&CONTAINER_HEADERS, &[]),
        sheet(&["Appointment #"], &[]),
    );

    let response = jobs::trigger_job(State(api.state.clone()), tenant_headers())
        .await
        .expect("trigger")
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    let listed = api
        .harness
        .jobs
        .list(TENANT_ID, None, 10, 0)
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);

    // The spawned run drives the job to a terminal state.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = api
        .harness
        .jobs
        .get(&listed[0].query_id)
        .await
        .expect("get")
        .expect("present");
    assert!(
        job.status == JobStatus::Completed || job.status == JobStatus::InProgress,
        "unexpected status {:?}",
        job.status
    );
}

#[tokio::test]
async fn admin_secret_with_tenant_id_authenticates() {
    let api = api().await;
    let response = schedule::get_schedule(State(api.state.clone()), admin_headers())
        .await
        .expect("schedule");
    assert!(!response.0.enabled);
    assert_eq!(response.0.frequency_minutes, 60);
}

#[tokio::test]
async fn wrong_admin_secret_is_rejected() {
    let api = api().await;
    let mut headers = HeaderMap::new();
    headers.insert("x-admin-secret", "guess".parse().expect("header"));
    headers.insert("x-tenant-id", "1".parse().expect("header"));

    let response = schedule::get_schedule(State(api.state.clone()), headers).await;
    let response = response.expect_err("should be rejected").into_response();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn schedule_round_trip() {
    let api = api().await;

    let updated = schedule::set_schedule(
        State(api.state.clone()),
        tenant_headers(),
        axum::Json(SetScheduleRequest {
            frequency_minutes: 15,
        }),
    )
    .await
    .expect("set");
    assert_eq!(updated.0.frequency_minutes, 15);

    let resumed = schedule::resume_schedule(State(api.state.clone()), tenant_headers())
        .await
        .expect("resume");
    assert!(resumed.0.enabled);
    assert!(api.state.scheduler.is_armed(TENANT_ID));

    let paused = schedule::pause_schedule(State(api.state.clone()), tenant_headers())
        .await
        .expect("pause");
    assert!(!paused.0.enabled);
    assert!(!api.state.scheduler.is_armed(TENANT_ID));
}

#[tokio::test]
async fn unknown_job_reads_as_not_found() {
    let api = api().await;
    let response = jobs::get_job(
        State(api.state.clone()),
        tenant_headers(),
        Path("q_1_999".to_owned()),
    )
    .await;
    let response = response.expect_err("missing job").into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn spreadsheet_metadata_and_token_download() {
    let api = api().await;
    write_master_mirror(
        api.harness.tenant_root(),
        ALL_CONTAINERS_SHEET,
        b"sheet bytes",
    )
    .expect("mirror");

    let info = spreadsheets::get_spreadsheet(
        State(api.state.clone()),
        tenant_headers(),
        Path(SpreadsheetKind::LatestList),
        Query(SpreadsheetQuery { query_id: None }),
    )
    .await
    .expect("metadata");
    assert_eq!(info.0.filename, ALL_CONTAINERS_SHEET);
    assert_eq!(info.0.size, u64::try_from("sheet bytes".len()).expect("len"));
    let token = info
        .0
        .download_url
        .strip_prefix("/files/")
        .expect("token url")
        .to_owned();

    let response = spreadsheets::download_file(State(api.state.clone()), Path(token.clone()))
        .await
        .expect("download")
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    // Tokens are single-use.
    let second = spreadsheets::download_file(State(api.state.clone()), Path(token))
        .await
        .err()
        .expect("consumed token")
        .into_response();
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_scoped_spreadsheet_requires_query_id() {
    let api = api().await;
    let response = spreadsheets::get_spreadsheet(
        State(api.state.clone()),
        tenant_headers(),
        Path(SpreadsheetKind::JobFiltered),
        Query(SpreadsheetQuery { query_id: None }),
    )
    .await;
    let response = response.expect_err("missing query id").into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
