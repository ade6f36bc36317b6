//! Tick coalescing and registry mutations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quayside::scheduler::Scheduler;
use quayside::store::{JobStatus, Platform};

use crate::common::{self, install_sheets, sheet, CONTAINER_HEADERS, TENANT_ID};

async fn job_count(harness: &common::Harness) -> usize {
    harness
        .jobs
        .list(TENANT_ID, None, 200, 0)
        .await
        .expect("list")
        .len()
}

#[tokio::test(start_paused = true)]
async fn ticks_skip_while_a_job_is_in_progress() {
    let harness = common::harness().await;
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &[]),
        sheet(&["Appointment #"], &[]),
    );

    let scheduler = Scheduler::new(
        harness.tenants.clone(),
        harness.jobs.clone(),
        Arc::clone(&harness.executor),
    );
    // Tenant harvests every minute.
    scheduler
        .update_frequency(TENANT_ID, 1)
        .await
        .expect("frequency");
    scheduler.resume(TENANT_ID).await.expect("resume");
    assert!(scheduler.is_armed(TENANT_ID));

    // A long-running job occupies the slot across several tick periods.
    let running = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create");
    harness
        .jobs
        .set_in_progress(&running.query_id, Path::new("/tmp/running"))
        .await
        .expect("claim");

    tokio::time::sleep(Duration::from_secs(185)).await;
    // Three ticks elapsed, none enqueued a duplicate.
    assert_eq!(job_count(&harness).await, 1);

    // Once the slot frees, the next tick enqueues exactly one run.
    harness
        .jobs
        .finish(&running.query_id, JobStatus::Completed, None, None)
        .await
        .expect("finish");
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(job_count(&harness).await, 2);

    scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn pause_stops_future_ticks_and_resume_rearms() {
    let harness = common::harness().await;
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &[]),
        sheet(&["Appointment #"], &[]),
    );

    let scheduler = Scheduler::new(
        harness.tenants.clone(),
        harness.jobs.clone(),
        Arc::clone(&harness.executor),
    );
    scheduler
        .update_frequency(TENANT_ID, 1)
        .await
        .expect("frequency");
    scheduler.resume(TENANT_ID).await.expect("resume");

    scheduler.pause(TENANT_ID).await.expect("pause");
    assert!(!scheduler.is_armed(TENANT_ID));
    let tenant = harness
        .tenants
        .get(TENANT_ID)
        .await
        .expect("get")
        .expect("tenant");
    assert!(!tenant.schedule_enabled);

    // Paused: no ticks fire.
    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(job_count(&harness).await, 0);

    // Resumed: ticks come back on the stored frequency.
    scheduler.resume(TENANT_ID).await.expect("resume again");
    assert!(scheduler.is_armed(TENANT_ID));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(job_count(&harness).await >= 1);

    scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn start_arms_only_enabled_tenants() {
    let harness = common::harness().await;

    let scheduler = Scheduler::new(
        harness.tenants.clone(),
        harness.jobs.clone(),
        Arc::clone(&harness.executor),
    );
    // Tenant 1 was created with scheduling disabled.
    scheduler.start().await.expect("start");
    assert!(!scheduler.is_armed(TENANT_ID));

    harness
        .tenants
        .set_schedule_enabled(TENANT_ID, true)
        .await
        .expect("enable");
    scheduler.start().await.expect("start again");
    assert!(scheduler.is_armed(TENANT_ID));
    assert_eq!(scheduler.armed_frequency(TENANT_ID), Some(60));

    scheduler.shutdown();
}
