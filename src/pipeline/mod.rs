//! The five-stage harvest pipeline.
//!
//! One [`PipelineExecutor::run`] call drives a single job end to end:
//! list → filter → bulk enrich → per-item appointment probe → appointment
//! list. Stages run strictly in order inside one worker task; per-stage
//! retries stay invisible to the job record. A newer job for the same tenant
//! cancels this one at the next observation point (between stage-4 items and
//! inside session-recovery waits).

pub mod enrich;
pub mod filter;
pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifacts::{
    write_master_mirror, JobArtifacts, ProbeProgress, ProbeStatus, ALL_APPOINTMENTS_SHEET,
    ALL_CONTAINERS_SHEET, FILTERED_CONTAINERS_SHEET,
};
use crate::config::PipelineConfig;
use crate::session::{SessionError, SessionManager};
use crate::store::{
    Job, JobStatus, JobStore, StoreError, SummaryStats, Tenant, TenantStore,
};
use crate::table::{
    Table, COL_CONTAINER, COL_FIRST_APPT_AFTER, COL_FIRST_APPT_BEFORE, COL_TRADE_TYPE,
};
use crate::upstream::{MoveType, ProbeRequest, TradeKind, UpstreamApi, UpstreamError};

/// Failure message recorded when the newer-job rule terminates a run.
pub const CANCELLED_MESSAGE: &str = "cancelled by newer job";

/// How often a run waiting for its tenant's in-progress slot re-checks.
const CLAIM_POLL: Duration = Duration::from_secs(5);

/// Why a run stopped.
#[derive(Debug, Error)]
enum RunError {
    /// A newer job for the tenant was observed.
    #[error("{CANCELLED_MESSAGE}")]
    Cancelled,
    /// An upstream call failed after its local retries.
    #[error("upstream failure: {0}")]
    Upstream(UpstreamError),
    /// Session acquisition or recovery failed.
    #[error("session failure: {0}")]
    Session(SessionError),
    /// Job or tenant record access failed.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    /// Artifact or spreadsheet handling failed.
    #[error("artifact failure: {0}")]
    Artifact(#[from] anyhow::Error),
}

impl From<SessionError> for RunError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::CancelledByNewerJob => Self::Cancelled,
            other => Self::Session(other),
        }
    }
}

/// Runs harvest jobs as background workers.
pub struct PipelineExecutor {
    upstream: Arc<dyn UpstreamApi>,
    tenants: TenantStore,
    jobs: JobStore,
    sessions: Arc<SessionManager>,
    config: PipelineConfig,
}

impl PipelineExecutor {
    /// Create an executor over shared components.
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        tenants: TenantStore,
        jobs: JobStore,
        sessions: Arc<SessionManager>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            upstream,
            tenants,
            jobs,
            sessions,
            config,
        }
    }

    /// Execute one job to its terminal state.
    ///
    /// Never returns an error: every failure path lands in the job record,
    /// and record-keeping failures themselves are logged.
    pub async fn run(&self, query_id: &str) {
        if let Err(e) = self.run_inner(query_id).await {
            error!(query_id, error = %e, "harvest run bookkeeping failed");
        }
    }

    async fn run_inner(&self, query_id: &str) -> anyhow::Result<()> {
        let job = self
            .jobs
            .get(query_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown job {query_id}"))?;
        let tenant = self
            .tenants
            .get(job.tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown tenant {}", job.tenant_id))?;

        // The folder must exist before the job can be in progress.
        let artifacts = JobArtifacts::create(&tenant.root_path, &job.query_id)?;

        if !self.claim(&tenant, &job, &artifacts).await? {
            self.jobs
                .finish(&job.query_id, JobStatus::Failed, None, Some(CANCELLED_MESSAGE))
                .await?;
            info!(query_id, tenant_id = tenant.id, "run cancelled before start");
            return Ok(());
        }

        info!(query_id, tenant_id = tenant.id, "harvest run started");
        match self.execute(&tenant, &job, &artifacts).await {
            Ok(stats) => {
                self.jobs
                    .finish(&job.query_id, JobStatus::Completed, Some(&stats), None)
                    .await?;
                info!(
                    query_id,
                    tenant_id = tenant.id,
                    totals_list = stats.totals_list,
                    totals_filtered = stats.totals_filtered,
                    probes_ok = stats.probes_ok,
                    probes_failed = stats.probes_failed,
                    total_appointments = stats.total_appointments,
                    duration_seconds = stats.duration_seconds,
                    "harvest run completed"
                );
            }
            Err(e) => {
                let message = e.to_string();
                self.jobs
                    .finish(&job.query_id, JobStatus::Failed, None, Some(&message))
                    .await?;
                warn!(query_id, tenant_id = tenant.id, error = %message, "harvest run failed");
            }
        }
        Ok(())
    }

    /// Wait for the tenant's single in-progress slot.
    ///
    /// Returns false when a newer job appears first, in which case this run
    /// must end as cancelled without executing.
    async fn claim(
        &self,
        tenant: &Tenant,
        job: &Job,
        artifacts: &JobArtifacts,
    ) -> anyhow::Result<bool> {
        loop {
            if self
                .jobs
                .set_in_progress(&job.query_id, artifacts.dir())
                .await?
            {
                return Ok(true);
            }
            if let Some(ordinal) = job.ordinal() {
                if self.jobs.find_newer(tenant.id, ordinal).await? {
                    return Ok(false);
                }
            }
            debug!(query_id = %job.query_id, "waiting for in-progress slot");
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    /// The five stages. Any error here fails the job with its message.
    async fn execute(
        &self,
        tenant: &Tenant,
        job: &Job,
        artifacts: &JobArtifacts,
    ) -> Result<SummaryStats, RunError> {
        let started = Instant::now();
        let ordinal = job.ordinal();
        let mut stats = SummaryStats::default();
        let mut session = self.sessions.ensure(tenant.id, ordinal).await?;

        // Stage 1: container listing.
        let listing = self
            .fetch_listing(tenant.id, ordinal, &mut session, Listing::Containers)
            .await?;
        artifacts.write_sheet(ALL_CONTAINERS_SHEET, &listing)?;
        write_master_mirror(&tenant.root_path, ALL_CONTAINERS_SHEET, &listing)?;
        let mut table = Table::from_xlsx_bytes(&listing)?;
        stats.totals_list = count(table.row_count());
        info!(query_id = %job.query_id, rows = stats.totals_list, "stage 1: listed containers");

        // Stage 2: filter and append output columns.
        filter::apply(&mut table);
        stats.totals_filtered = count(table.row_count());
        artifacts.write_sheet(FILTERED_CONTAINERS_SHEET, &table.to_xlsx_bytes()?)?;
        info!(
            query_id = %job.query_id,
            rows = stats.totals_filtered,
            "stage 2: filtered candidates"
        );

        // Stage 3: one bulk-info call, split by trade type.
        let kinds: Vec<TradeKind> = (0..table.row_count())
            .map(|row| probe::trade_kind_for(table.value(row, COL_TRADE_TYPE).unwrap_or("")))
            .collect();
        let import_ids = item_ids(&table, &kinds, TradeKind::Import);
        let export_ids = item_ids(&table, &kinds, TradeKind::Export);
        stats.totals_import = count(import_ids.len());
        stats.totals_export = count(export_ids.len());

        let mut pregate: HashMap<String, bool> = HashMap::new();
        let mut bookings: HashMap<String, String> = HashMap::new();
        if !import_ids.is_empty() || !export_ids.is_empty() {
            let bulk = self
                .with_recovery(tenant.id, ordinal, &mut session, |s| {
                    let upstream = Arc::clone(&self.upstream);
                    let imports = import_ids.clone();
                    let exports = export_ids.clone();
                    async move { upstream.get_bulk_info(&s, &imports, &exports).await }
                })
                .await?;

            let row_of: HashMap<String, usize> = (0..table.row_count())
                .filter_map(|row| {
                    table
                        .value(row, COL_CONTAINER)
                        .map(|id| (id.trim().to_owned(), row))
                })
                .collect();

            for record in &bulk.imports {
                pregate.insert(record.item_id.clone(), record.pregate_passed);
                if let Some(&row) = row_of.get(record.item_id.as_str()) {
                    for (milestone, column) in enrich::MILESTONE_COLUMNS {
                        table.set_value(row, column, enrich::milestone_date(&record.timeline, milestone));
                    }
                }
            }
            for record in &bulk.exports {
                if let Some(booking) = &record.booking_number {
                    bookings.insert(record.item_id.clone(), booking.clone());
                }
            }
        }
        artifacts.write_sheet(FILTERED_CONTAINERS_SHEET, &table.to_xlsx_bytes()?)?;
        info!(
            query_id = %job.query_id,
            imports = stats.totals_import,
            exports = stats.totals_export,
            "stage 3: bulk info applied"
        );

        // Stage 4: sequential per-item probes.
        self.probe_items(
            tenant,
            job,
            artifacts,
            &mut session,
            &mut table,
            &kinds,
            &pregate,
            &bookings,
            &mut stats,
        )
        .await?;

        // Stage 5: appointment listing.
        let listing = self
            .fetch_listing(tenant.id, ordinal, &mut session, Listing::Appointments)
            .await?;
        artifacts.write_sheet(ALL_APPOINTMENTS_SHEET, &listing)?;
        write_master_mirror(&tenant.root_path, ALL_APPOINTMENTS_SHEET, &listing)?;
        stats.total_appointments = count(Table::from_xlsx_bytes(&listing)?.row_count());
        info!(
            query_id = %job.query_id,
            rows = stats.total_appointments,
            "stage 5: listed appointments"
        );

        stats.duration_seconds = started.elapsed().as_secs();
        Ok(stats)
    }

    /// Stages 1 and 5: list, then download the sheet with the same session.
    ///
    /// The listing URL is only valid for the session that produced it, so
    /// the list + download pair retries as a unit.
    async fn fetch_listing(
        &self,
        tenant_id: i64,
        ordinal: Option<i64>,
        session: &mut String,
        which: Listing,
    ) -> Result<Vec<u8>, RunError> {
        self.with_recovery(tenant_id, ordinal, session, |s| {
            let upstream = Arc::clone(&self.upstream);
            async move {
                let listing = match which {
                    Listing::Containers => upstream.list_containers(&s).await?,
                    Listing::Appointments => upstream.list_appointments(&s).await?,
                };
                let download = upstream.download(&s, &listing.file_url).await?;
                Ok(download.bytes)
            }
        })
        .await
    }

    /// Run one upstream operation with the uniform stage retry policy:
    /// `SessionInvalid` recovers the session and retries once; `Transient`
    /// re-ensures the session and retries once; two attempts total.
    async fn with_recovery<T, F, Fut>(
        &self,
        tenant_id: i64,
        ordinal: Option<i64>,
        session: &mut String,
        op: F,
    ) -> Result<T, RunError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        match op(session.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_session_invalid() => {
                warn!(tenant_id, error = %e, "session rejected mid-stage, recovering");
                *session = self.sessions.recover(tenant_id, ordinal).await?;
                op(session.clone()).await.map_err(RunError::Upstream)
            }
            Err(e) if e.is_transient() => {
                warn!(tenant_id, error = %e, "transient upstream failure, retrying");
                *session = self.sessions.ensure(tenant_id, ordinal).await?;
                op(session.clone()).await.map_err(RunError::Upstream)
            }
            Err(e) => Err(RunError::Upstream(e)),
        }
    }

    /// Stage 4. Item failures are recorded and skipped; only session,
    /// store, artifact, and cancellation failures abort the stage.
    #[allow(clippy::too_many_arguments)]
    async fn probe_items(
        &self,
        tenant: &Tenant,
        job: &Job,
        artifacts: &JobArtifacts,
        session: &mut String,
        table: &mut Table,
        kinds: &[TradeKind],
        pregate: &HashMap<String, bool>,
        bookings: &HashMap<String, String>,
        stats: &mut SummaryStats,
    ) -> Result<(), RunError> {
        let ordinal = job.ordinal();
        let checkpoint_every = self.config.stage4_checkpoint_every.max(1);
        let mut progress = artifacts.read_progress();
        let mut since_flush = 0usize;

        for row in 0..table.row_count() {
            // Observation point: a newer job cancels between items.
            if let Some(ordinal) = ordinal {
                if self.jobs.find_newer(tenant.id, ordinal).await? {
                    return Err(RunError::Cancelled);
                }
            }

            let item_id = table
                .value(row, COL_CONTAINER)
                .unwrap_or("")
                .trim()
                .to_owned();
            if item_id.is_empty() {
                continue;
            }
            // Resume: items already probed successfully in this job are done.
            if progress
                .get(&item_id)
                .is_some_and(|p| p.status == ProbeStatus::Ok)
            {
                debug!(item_id = %item_id, "stage 4: skipping already-checked item");
                continue;
            }

            let kind = kinds.get(row).copied().unwrap_or(TradeKind::Import);
            let epoch = Utc::now().timestamp();

            let identifier = match kind {
                TradeKind::Import => item_id.clone(),
                TradeKind::Export => match bookings.get(&item_id) {
                    Some(booking) => booking.clone(),
                    // An export without a booking number cannot be probed.
                    None => {
                        warn!(item_id = %item_id, "stage 4: export has no booking number");
                        stats.probes_failed = stats.probes_failed.saturating_add(1);
                        progress.insert(
                            item_id,
                            ProbeProgress {
                                status: ProbeStatus::Failed,
                                stage4_epoch: epoch,
                            },
                        );
                        artifacts.write_progress(&progress)?;
                        continue;
                    }
                },
            };

            let move_type =
                probe::move_type_for(kind, pregate.get(&item_id).copied().unwrap_or(false));
            let request = ProbeRequest {
                kind,
                terminal: probe::terminal_for_row(table, row, kind),
                move_type,
                trucking_company: probe::TRUCKING_COMPANY.to_owned(),
                identifier,
                item_id: item_id.clone(),
                plate: probe::TRUCK_PLATE.to_owned(),
                own_chassis: probe::OWN_CHASSIS,
            };

            let outcome = self
                .with_recovery(tenant.id, ordinal, session, |s| {
                    let upstream = Arc::clone(&self.upstream);
                    let request = request.clone();
                    async move { upstream.probe_appointments(&s, &request).await }
                })
                .await;

            let status = match outcome {
                Ok(response) => {
                    artifacts.write_response(
                        &item_id,
                        epoch,
                        &serde_json::to_vec_pretty(&response).map_err(anyhow::Error::from)?,
                    )?;
                    if let Some(url) = &response.screenshot_url {
                        match self.upstream.download(session, url).await {
                            Ok(shot) => {
                                artifacts.write_screenshot(&item_id, epoch, &shot.bytes)?;
                            }
                            // A lost screenshot does not fail the item.
                            Err(e) => {
                                warn!(item_id = %item_id, error = %e, "stage 4: screenshot download failed");
                            }
                        }
                    }

                    match kind {
                        TradeKind::Import => {
                            if let Some(date) = probe::earliest_slot_date(&response.available_times)
                            {
                                let column = match move_type {
                                    MoveType::PickFull => COL_FIRST_APPT_BEFORE,
                                    _ => COL_FIRST_APPT_AFTER,
                                };
                                table.set_value(row, column, date);
                            }
                            stats.probes_ok = stats.probes_ok.saturating_add(1);
                            ProbeStatus::Ok
                        }
                        TradeKind::Export => {
                            stats.probes_ok = stats.probes_ok.saturating_add(1);
                            if response.calendar_found == Some(false) {
                                warn!(item_id = %item_id, "stage 4: no booking calendar found");
                                ProbeStatus::Warned
                            } else {
                                ProbeStatus::Ok
                            }
                        }
                    }
                }
                Err(RunError::Upstream(e)) => {
                    // Exhausted probe attempts; the job carries on.
                    warn!(item_id = %item_id, error = %e, "stage 4: probe failed");
                    stats.probes_failed = stats.probes_failed.saturating_add(1);
                    ProbeStatus::Failed
                }
                Err(other) => return Err(other),
            };

            progress.insert(
                item_id,
                ProbeProgress {
                    status,
                    stage4_epoch: epoch,
                },
            );
            artifacts.write_progress(&progress)?;

            since_flush = since_flush.saturating_add(1);
            if since_flush >= checkpoint_every {
                artifacts.write_sheet(FILTERED_CONTAINERS_SHEET, &table.to_xlsx_bytes()?)?;
                since_flush = 0;
            }
        }

        artifacts.write_sheet(FILTERED_CONTAINERS_SHEET, &table.to_xlsx_bytes()?)?;
        artifacts.write_progress(&progress)?;
        info!(
            query_id = %job.query_id,
            probes_ok = stats.probes_ok,
            probes_failed = stats.probes_failed,
            "stage 4: probes finished"
        );
        Ok(())
    }
}

/// Which listing a stage fetches.
#[derive(Debug, Clone, Copy)]
enum Listing {
    Containers,
    Appointments,
}

/// Saturating usize → u64 for the summary counters.
fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn item_ids(table: &Table, kinds: &[TradeKind], wanted: TradeKind) -> Vec<String> {
    (0..table.row_count())
        .filter(|&row| kinds.get(row).copied() == Some(wanted))
        .filter_map(|row| table.value(row, COL_CONTAINER))
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .collect()
}
