//! End-to-end pipeline runs against the scripted upstream.

use std::collections::VecDeque;
use std::fs;

use quayside::artifacts::{tenant_emodal_dir, JobArtifacts, ProbeStatus};
use quayside::store::{JobStatus, Platform};
use quayside::table::{
    Table, COL_DEPARTED_TERMINAL, COL_EMPTY_RECEIVED, COL_FIRST_APPT_AFTER, COL_FIRST_APPT_BEFORE,
    COL_MANIFESTED, NA,
};
use quayside::upstream::{MoveType, UpstreamError};

use crate::common::{
    self, container_row, export_info, import_info, install_sheets, sheet, Harness,
    CONTAINER_HEADERS, TENANT_ID,
};

/// Ten listed rows, three of which survive the filter.
fn standard_container_sheet() -> Vec<u8> {
    let rows = vec![
        container_row("MSCU1", "IMPORT", "NO", "N/A", "TTI"),
        container_row("MSCU2", "IMPORT", "no", "n/a", "ITS"),
        container_row("EXPU1", "EXPORT", "NO", "N/A", "PCT"),
        container_row("HOLD1", "IMPORT", "YES", "N/A", "TTI"),
        container_row("HOLD2", "IMPORT", "CUSTOMS", "N/A", "TTI"),
        container_row("TICK1", "IMPORT", "NO", "T-1001", "TTI"),
        container_row("TICK2", "EXPORT", "NO", "T-1002", "TTI"),
        container_row("HOLD3", "EXPORT", "YES", "T-1003", "TTI"),
        container_row("TICK3", "IMPORT", "NO", "T-1004", "TTI"),
        container_row("HOLD4", "IMPORT", "YES", "N/A", "TTI"),
    ];
    sheet(&CONTAINER_HEADERS, &rows)
}

fn appointments_sheet() -> Vec<u8> {
    sheet(
        &["Appointment #", "Container #", "Date"],
        &[
            vec!["A1", "MSCU9", "10/10/2025"],
            vec!["A2", "MSCU8", "10/11/2025"],
            vec!["A3", "MSCU7", "10/12/2025"],
            vec!["A4", "MSCU6", "10/13/2025"],
        ],
    )
}

fn script_standard_run(harness: &Harness) {
    install_sheets(harness, standard_container_sheet(), appointments_sheet());
    let mut script = harness.upstream.lock();
    script.bulk.imports = vec![
        import_info(
            "MSCU1",
            false,
            &[("Manifested", "2025-10-01T08:00:00")],
        ),
        import_info(
            "MSCU2",
            true,
            &[
                ("Manifested", "2025-10-02"),
                ("Departed Terminal", "2025-10-05"),
                ("Empty Received", "2025-10-07"),
            ],
        ),
    ];
    script.bulk.exports = vec![export_info("EXPU1", Some("BOOK99"))];
    script.available_times.insert(
        "MSCU1".to_owned(),
        vec![
            "10/16/2025 01:00 PM - 02:00 PM".to_owned(),
            "10/14/2025 07:00 AM - 08:00 AM".to_owned(),
        ],
    );
    script.available_times.insert(
        "MSCU2".to_owned(),
        vec!["10/20/2025 09:00 AM - 10:00 AM".to_owned()],
    );
}

async fn run_one_job(harness: &Harness) -> quayside::store::Job {
    let job = harness
        .jobs
        .create(TENANT_ID, Platform::Emodal)
        .await
        .expect("create job");
    harness.executor.run(&job.query_id).await;
    harness
        .jobs
        .get(&job.query_id)
        .await
        .expect("get job")
        .expect("job present")
}

#[tokio::test]
async fn happy_path_completes_with_stats_and_artifacts() {
    let harness = common::harness().await;
    script_standard_run(&harness);

    let job = run_one_job(&harness).await;

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    let stats = job.summary_stats.expect("stats");
    assert_eq!(stats.totals_list, 10);
    assert_eq!(stats.totals_filtered, 3);
    assert_eq!(stats.totals_import, 2);
    assert_eq!(stats.totals_export, 1);
    assert_eq!(stats.probes_ok, 3);
    assert_eq!(stats.probes_failed, 0);
    assert_eq!(stats.total_appointments, 4);

    // All stage artifacts and the master mirrors are on disk.
    let artifacts = JobArtifacts::open(harness.tenant_root(), &job.query_id);
    assert!(artifacts.containers_sheet().is_file());
    assert!(artifacts.filtered_sheet().is_file());
    assert!(artifacts.appointments_sheet().is_file());
    let emodal = tenant_emodal_dir(harness.tenant_root());
    assert!(emodal.join("all_containers.xlsx").is_file());
    assert!(emodal.join("all_appointments.xlsx").is_file());

    // Every item has a response, a screenshot, and an ok checkpoint.
    let progress = artifacts.read_progress();
    assert_eq!(progress.len(), 3);
    assert!(progress.values().all(|p| p.status == ProbeStatus::Ok));

    // Session used for the run is the one persisted on the tenant.
    let tenant = harness
        .tenants
        .get(TENANT_ID)
        .await
        .expect("get")
        .expect("tenant");
    assert_eq!(tenant.session_id.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn happy_path_sheet_contents() {
    let harness = common::harness().await;
    script_standard_run(&harness);
    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);

    let artifacts = JobArtifacts::open(harness.tenant_root(), &job.query_id);
    let table =
        Table::from_xlsx_bytes(&fs::read(artifacts.filtered_sheet()).expect("read sheet"))
            .expect("parse sheet");
    assert_eq!(table.row_count(), 3);

    // MSCU1: pregate not passed, PICK FULL, earliest of the unsorted list.
    assert_eq!(table.value(0, COL_MANIFESTED), Some("10/01/2025"));
    assert_eq!(table.value(0, COL_DEPARTED_TERMINAL), Some(NA));
    assert_eq!(table.value(0, COL_EMPTY_RECEIVED), Some(NA));
    assert_eq!(table.value(0, COL_FIRST_APPT_BEFORE), Some("10/14/2025"));
    assert_eq!(table.value(0, COL_FIRST_APPT_AFTER), Some(NA));

    // MSCU2: pregate passed, DROP EMPTY, slot lands in the After column.
    assert_eq!(table.value(1, COL_MANIFESTED), Some("10/02/2025"));
    assert_eq!(table.value(1, COL_DEPARTED_TERMINAL), Some("10/05/2025"));
    assert_eq!(table.value(1, COL_EMPTY_RECEIVED), Some("10/07/2025"));
    assert_eq!(table.value(1, COL_FIRST_APPT_BEFORE), Some(NA));
    assert_eq!(table.value(1, COL_FIRST_APPT_AFTER), Some("10/20/2025"));

    // EXPU1: export rows keep every appended column at N/A.
    for column in [
        COL_MANIFESTED,
        COL_FIRST_APPT_BEFORE,
        COL_DEPARTED_TERMINAL,
        COL_FIRST_APPT_AFTER,
        COL_EMPTY_RECEIVED,
    ] {
        assert_eq!(table.value(2, column), Some(NA), "column {column}");
    }
}

#[tokio::test]
async fn happy_path_probe_requests() {
    let harness = common::harness().await;
    script_standard_run(&harness);
    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);

    let script = harness.upstream.lock();
    assert_eq!(script.probes_seen.len(), 3);

    let mscu1 = &script.probes_seen[0];
    assert_eq!(mscu1.move_type, MoveType::PickFull);
    assert_eq!(mscu1.terminal, "Total Terminals International");
    assert_eq!(mscu1.identifier, "MSCU1");
    assert_eq!(mscu1.trucking_company, "K & R TRANSPORTATION LLC");

    let mscu2 = &script.probes_seen[1];
    assert_eq!(mscu2.move_type, MoveType::DropEmpty);
    assert_eq!(mscu2.terminal, "International Transportation Service");

    // Export probes identify by booking number and still carry the item id.
    let expu1 = &script.probes_seen[2];
    assert_eq!(expu1.move_type, MoveType::DropFull);
    assert_eq!(expu1.identifier, "BOOK99");
    assert_eq!(expu1.item_id, "EXPU1");
    assert_eq!(expu1.terminal, "Pacific Container Terminal");
}

#[tokio::test]
async fn session_invalidated_mid_stage_4_recovers_once() {
    let harness = common::harness().await;
    let rows: Vec<Vec<&str>> = vec![
        container_row("IMP1", "IMPORT", "NO", "N/A", "TTI"),
        container_row("IMP2", "IMPORT", "NO", "N/A", "TTI"),
        container_row("IMP3", "IMPORT", "NO", "N/A", "TTI"),
        container_row("IMP4", "IMPORT", "NO", "N/A", "TTI"),
        container_row("IMP5", "IMPORT", "NO", "N/A", "TTI"),
    ];
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &rows),
        sheet(&["Appointment #"], &[]),
    );
    {
        let mut script = harness.upstream.lock();
        script.bulk.imports = (1..=5)
            .map(|i| import_info(&format!("IMP{i}"), false, &[]))
            .collect();
        // The third probe call hits an expired session.
        script.invalidate_after_probes = Some(2);
    }

    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    let stats = job.summary_stats.expect("stats");
    assert_eq!(stats.probes_ok, 5);
    assert_eq!(stats.probes_failed, 0);

    // Exactly one re-login: sess-1 died, sess-2 finished the run.
    let tenant = harness
        .tenants
        .get(TENANT_ID)
        .await
        .expect("get")
        .expect("tenant");
    assert_eq!(tenant.session_id.as_deref(), Some("sess-2"));
    assert_eq!(harness.upstream.lock().sessions_minted, 2);
}

#[tokio::test]
async fn transient_probe_failures_do_not_fail_the_job() {
    let harness = common::harness().await;
    let rows = vec![
        container_row("GOOD1", "IMPORT", "NO", "N/A", "TTI"),
        container_row("FLAKY", "IMPORT", "NO", "N/A", "TTI"),
        container_row("GOOD2", "IMPORT", "NO", "N/A", "TTI"),
    ];
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &rows),
        sheet(&["Appointment #"], &[]),
    );
    {
        let mut script = harness.upstream.lock();
        script.bulk.imports = vec![
            import_info("GOOD1", false, &[]),
            import_info("FLAKY", false, &[]),
            import_info("GOOD2", false, &[]),
        ];
        // Both attempts for FLAKY fail; the job must carry on.
        script.probe_failures.insert(
            "FLAKY".to_owned(),
            VecDeque::from(vec![
                UpstreamError::Transient("reset".to_owned()),
                UpstreamError::Transient("reset again".to_owned()),
            ]),
        );
    }

    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    let stats = job.summary_stats.expect("stats");
    assert_eq!(stats.probes_ok, 2);
    assert_eq!(stats.probes_failed, 1);

    let artifacts = JobArtifacts::open(harness.tenant_root(), &job.query_id);
    let progress = artifacts.read_progress();
    assert_eq!(progress.get("FLAKY").expect("entry").status, ProbeStatus::Failed);
    assert_eq!(progress.get("GOOD1").expect("entry").status, ProbeStatus::Ok);

    // The flaky row's appointment columns stay untouched.
    let table =
        Table::from_xlsx_bytes(&fs::read(artifacts.filtered_sheet()).expect("read")).expect("parse");
    assert_eq!(table.value(1, COL_FIRST_APPT_BEFORE), Some(NA));
    assert_eq!(table.value(1, COL_FIRST_APPT_AFTER), Some(NA));
}

#[tokio::test]
async fn export_without_booking_number_fails_that_item_only() {
    let harness = common::harness().await;
    let rows = vec![
        container_row("EXPA", "EXPORT", "NO", "N/A", "PCT"),
        container_row("IMPA", "IMPORT", "NO", "N/A", "TTI"),
    ];
    install_sheets(
        &harness,
        sheet(&CONTAINER_HEADERS, &rows),
        sheet(&["Appointment #"], &[]),
    );
    {
        let mut script = harness.upstream.lock();
        script.bulk.imports = vec![import_info("IMPA", false, &[])];
        script.bulk.exports = vec![export_info("EXPA", None)];
    }

    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    let stats = job.summary_stats.expect("stats");
    assert_eq!(stats.probes_ok, 1);
    assert_eq!(stats.probes_failed, 1);

    // The bookingless export never reached the upstream.
    let script = harness.upstream.lock();
    assert_eq!(script.probes_seen.len(), 1);
    assert_eq!(script.probes_seen[0].item_id, "IMPA");
}

#[tokio::test]
async fn progress_checkpoints_are_scoped_per_job() {
    let harness = common::harness().await;
    script_standard_run(&harness);

    let first = run_one_job(&harness).await;
    assert_eq!(first.status, JobStatus::Completed, "{:?}", first.error_message);
    assert_eq!(harness.upstream.lock().probes_seen.len(), 3);

    // A later job starts from scratch: its checkpoint file is its own.
    let second = run_one_job(&harness).await;
    assert_eq!(second.status, JobStatus::Completed, "{:?}", second.error_message);
    assert_eq!(harness.upstream.lock().probes_seen.len(), 6);

    let first_artifacts = JobArtifacts::open(harness.tenant_root(), &first.query_id);
    let second_artifacts = JobArtifacts::open(harness.tenant_root(), &second.query_id);
    assert!(first_artifacts.progress_file().is_file());
    assert!(second_artifacts.progress_file().is_file());
    assert_ne!(first_artifacts.progress_file(), second_artifacts.progress_file());
}

#[tokio::test]
async fn permanent_listing_failure_fails_the_job() {
    let harness = common::harness().await;
    // No sheets installed: the downloads map is empty, so the container
    // listing download comes back permanent.
    {
        let mut script = harness.upstream.lock();
        script.calendar_found = true;
    }

    let job = run_one_job(&harness).await;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.expect("error message");
    assert!(message.contains("upstream"), "{message}");
}
