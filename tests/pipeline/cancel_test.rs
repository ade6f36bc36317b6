//! Newer-job cancellation behavior.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use quayside::artifacts::JobArtifacts;
use quayside::store::{JobStatus, Platform};
use quayside::upstream::UpstreamError;

use crate::common::{
    self, container_row, import_info, install_sheets, sheet, CONTAINER_HEADERS, TENANT_ID,
};

#[tokio::test(start_paused = true)]
async fn job_in_auth_retry_wait_is_cancelled_by_newer_job() {
    let harness = common::harness().await;
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &[]),
        sheet(&["Appointment #"], &[]),
    );
    {
        let mut script = harness.upstream.lock();
        // Every login attempt is rejected, so the first job parks in the
        // acquisition retry wait.
        script.acquire_failures = VecDeque::from(vec![
            UpstreamError::AuthInvalid("401".to_owned()),
            UpstreamError::AuthInvalid("401".to_owned()),
            UpstreamError::AuthInvalid("401".to_owned()),
        ]);
    }

    let first = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create first");
    let executor = Arc::clone(&harness.executor);
    let first_id = first.query_id.clone();
    let run = tokio::spawn(async move { executor.run(&first_id).await });

    // Let the first job enter its retry wait, then trigger a newer one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create second");

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("first run should stop within the wait quantum")
        .expect("join");

    let first = harness
        .jobs
        .get(&first.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(first.status, JobStatus::Failed);
    let message = first.error_message.expect("error message");
    assert!(message.contains("cancelled"), "{message}");
    assert!(message.contains("newer"), "{message}");

    // The newer job can now take the tenant's in-progress slot.
    let claimed = harness
        .jobs
        .set_in_progress(&second.query_id, std::path::Path::new("/tmp/unused"))
        .await
        .expect("claim");
    assert!(claimed);
}

#[tokio::test]
async fn run_is_cancelled_between_stage_4_items() {
    let harness = common::harness().await;
    let rows = vec![container_row("IMP1", "IMPORT", "NO", "N/A", "TTI")];
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &rows),
        sheet(&["Appointment #"], &[]),
    );
    harness.upstream.lock().bulk.imports = vec![import_info("IMP1", false, &[])];

    let older = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create older");
    // A newer job already exists when the older run reaches stage 4.
    harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create newer");

    harness.executor.run(&older.query_id).await;

    let older = harness
        .jobs
        .get(&older.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(older.status, JobStatus::Failed);
    assert_eq!(
        older.error_message.as_deref(),
        Some("cancelled by newer job")
    );

    // No probe went out, but the earlier stages' artifacts remain.
    assert!(harness.upstream.lock().probes_seen.is_empty());
    let artifacts = JobArtifacts::open(harness.tenant_root(), &older.query_id);
    assert!(artifacts.containers_sheet().is_file());
    assert!(artifacts.filtered_sheet().is_file());
}

#[tokio::test(start_paused = true)]
async fn pending_job_waits_for_the_running_one() {
    let harness = common::harness().await;
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &[]),
        sheet(&["Appointment #"], &[]),
    );

    // An older job holds the slot but is not actually running; the newer
    // run must park, then get cancelled when an even newer job appears.
    let holder = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create holder");
    harness
        .jobs
        .set_in_progress(&holder.query_id, std::path::Path::new("/tmp/holder"))
        .await
        .expect("claim");

    let waiting = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create waiting");
    let executor = Arc::clone(&harness.executor);
    let waiting_id = waiting.query_id.clone();
    let run = tokio::spawn(async move { executor.run(&waiting_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let still_pending = harness
        .jobs
        .get(&waiting.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(still_pending.status, JobStatus::Pending);

    harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create newest");

    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("waiting run should exit once outranked")
        .expect("join");
    let waiting = harness
        .jobs
        .get(&waiting.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(waiting.status, JobStatus::Failed);
    assert_eq!(
        waiting.error_message.as_deref(),
        Some("cancelled by newer job")
    );
}
