//! Shared fixture for integration tests: a scripted upstream, an in-memory
//! store, and a tenant rooted in a temp directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use quayside::config::PipelineConfig;
use quayside::credentials::UpstreamCredentials;
use quayside::db::connect_in_memory;
use quayside::pipeline::PipelineExecutor;
use quayside::session::{RetryPolicy, SessionManager};
use quayside::store::{JobStore, TenantStore};
use quayside::table::Table;
use quayside::upstream::{
    AcquiredSession, BulkExportInfo, BulkImportInfo, BulkInfoResponse, Download, ListingResponse,
    ProbeRequest, ProbeResponse, TimelineEntry, UpstreamApi, UpstreamError,
};

pub const TENANT_ID: i64 = 1;
pub const CONTAINERS_URL: &str = "sheet://containers";
pub const APPOINTMENTS_URL: &str = "sheet://appointments";

/// Mutable script and call log of the fake upstream.
#[derive(Default)]
pub struct UpstreamScript {
    /// Sessions the upstream currently accepts.
    pub valid_sessions: HashSet<String>,
    /// What `list_active_sessions` reports.
    pub active_sessions: Vec<String>,
    /// Counter for minted session ids.
    pub sessions_minted: u32,
    /// Errors to serve for upcoming `acquire_session` calls.
    pub acquire_failures: VecDeque<UpstreamError>,
    /// Bytes served per download URL.
    pub downloads: HashMap<String, Vec<u8>>,
    /// Bulk-info answer.
    pub bulk: BulkInfoResponse,
    /// Slot lists per item id for import probes.
    pub available_times: HashMap<String, Vec<String>>,
    /// Whether export probes find a calendar.
    pub calendar_found: bool,
    /// Planned failures per item id, consumed one per probe attempt.
    pub probe_failures: HashMap<String, VecDeque<UpstreamError>>,
    /// Invalidate the current session when this many probes have succeeded.
    pub invalidate_after_probes: Option<u64>,
    /// Successful probes so far.
    pub probes_succeeded: u64,
    /// Every probe request that reached the upstream.
    pub probes_seen: Vec<ProbeRequest>,
}

/// Scripted [`UpstreamApi`] with a call log.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<UpstreamScript>,
}

impl ScriptedUpstream {
    pub fn lock(&self) -> MutexGuard<'_, UpstreamScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_session(script: &UpstreamScript, session: &str) -> Result<(), UpstreamError> {
        if script.valid_sessions.contains(session) {
            Ok(())
        } else {
            Err(UpstreamError::SessionInvalid(format!(
                "session {session} expired"
            )))
        }
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn list_containers(&self, session: &str) -> Result<ListingResponse, UpstreamError> {
        let script = self.lock();
        Self::check_session(&script, session)?;
        Ok(ListingResponse {
            file_url: CONTAINERS_URL.to_owned(),
        })
    }

    async fn list_appointments(&self, session: &str) -> Result<ListingResponse, UpstreamError> {
        let script = self.lock();
        Self::check_session(&script, session)?;
        Ok(ListingResponse {
            file_url: APPOINTMENTS_URL.to_owned(),
        })
    }

    async fn get_bulk_info(
        &self,
        session: &str,
        _import_ids: &[String],
        _export_ids: &[String],
    ) -> Result<BulkInfoResponse, UpstreamError> {
        let script = self.lock();
        Self::check_session(&script, session)?;
        Ok(script.bulk.clone())
    }

    async fn probe_appointments(
        &self,
        session: &str,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, UpstreamError> {
        let mut script = self.lock();
        Self::check_session(&script, session)?;

        if script.invalidate_after_probes == Some(script.probes_succeeded) {
            script.invalidate_after_probes = None;
            script.valid_sessions.remove(session);
            return Err(UpstreamError::SessionInvalid(format!(
                "session {session} expired"
            )));
        }

        if let Some(failures) = script.probe_failures.get_mut(&request.item_id) {
            if let Some(failure) = failures.pop_front() {
                return Err(failure);
            }
        }

        script.probes_seen.push(request.clone());
        script.probes_succeeded = script.probes_succeeded.saturating_add(1);

        let screenshot_url = format!("shot://{}", request.item_id);
        script
            .downloads
            .insert(screenshot_url.clone(), b"\x89PNG fake".to_vec());

        let response = match request.kind {
            quayside::upstream::TradeKind::Import => ProbeResponse {
                available_times: script
                    .available_times
                    .get(&request.item_id)
                    .cloned()
                    .unwrap_or_default(),
                calendar_found: None,
                screenshot_url: Some(screenshot_url),
            },
            quayside::upstream::TradeKind::Export => ProbeResponse {
                available_times: Vec::new(),
                calendar_found: Some(script.calendar_found),
                screenshot_url: Some(screenshot_url),
            },
        };
        Ok(response)
    }

    async fn acquire_session(
        &self,
        _creds: &UpstreamCredentials,
    ) -> Result<AcquiredSession, UpstreamError> {
        let mut script = self.lock();
        if let Some(failure) = script.acquire_failures.pop_front() {
            return Err(failure);
        }
        script.sessions_minted = script.sessions_minted.saturating_add(1);
        let session_id = format!("sess-{}", script.sessions_minted);
        script.valid_sessions.insert(session_id.clone());
        Ok(AcquiredSession {
            session_id,
            reused: false,
        })
    }

    async fn list_active_sessions(&self, _username: &str) -> Result<Vec<String>, UpstreamError> {
        Ok(self.lock().active_sessions.clone())
    }

    async fn download(&self, session: &str, url: &str) -> Result<Download, UpstreamError> {
        let script = self.lock();
        Self::check_session(&script, session)?;
        script
            .downloads
            .get(url)
            .map(|bytes| Download {
                bytes: bytes.clone(),
                content_type: None,
            })
            .ok_or_else(|| UpstreamError::Permanent(format!("unknown url {url}")))
    }
}

/// Fully wired engine over the scripted upstream.
pub struct Harness {
    pub upstream: Arc<ScriptedUpstream>,
    pub tenants: TenantStore,
    pub jobs: JobStore,
    pub executor: Arc<PipelineExecutor>,
    pub root: tempfile::TempDir,
}

impl Harness {
    /// Path of the tenant's on-disk root.
    pub fn tenant_root(&self) -> &Path {
        self.root.path()
    }
}

/// Millisecond-scale retry policy so recovery waits finish inside tests.
pub fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        retry_delay: Duration::from_millis(300),
        cancel_poll: Duration::from_millis(50),
    }
}

/// Build a harness with the given session retry policy.
pub async fn harness_with_policy(policy: RetryPolicy) -> Harness {
    let pool = connect_in_memory().await.expect("pool");
    let tenants = TenantStore::new(pool.clone());
    let jobs = JobStore::new(pool);

    let root = tempfile::tempdir().expect("tempdir");
    write_credentials(root.path());
    tenants
        .create(TENANT_ID, "Acme Drayage", "tok-acme", root.path(), 60)
        .await
        .expect("tenant");

    let upstream = Arc::new(ScriptedUpstream::default());
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&upstream) as Arc<dyn UpstreamApi>,
        tenants.clone(),
        jobs.clone(),
        policy,
    ));
    let executor = Arc::new(PipelineExecutor::new(
        Arc::clone(&upstream) as Arc<dyn UpstreamApi>,
        tenants.clone(),
        jobs.clone(),
        sessions,
        PipelineConfig::default(),
    ));

    Harness {
        upstream,
        tenants,
        jobs,
        executor,
        root,
    }
}

/// Build a harness with the quick policy.
pub async fn harness() -> Harness {
    harness_with_policy(quick_policy()).await
}

fn write_credentials(root: &Path) {
    fs::create_dir_all(root).expect("mkdir");
    let path = root.join(".env");
    fs::write(
        &path,
        "EMODAL_USERNAME=acme\nEMODAL_PASSWORD=pw\nCAPTCHA_API_KEY=cap\n",
    )
    .expect("write creds");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");
    }
}

/// Serialize a header + rows into xlsx bytes.
pub fn sheet(headers: &[&str], rows: &[Vec<&str>]) -> Vec<u8> {
    let table = Table::new(
        headers.iter().map(|h| (*h).to_owned()).collect(),
        rows.iter()
            .map(|row| row.iter().map(|c| (*c).to_owned()).collect())
            .collect(),
    );
    table.to_xlsx_bytes().expect("xlsx")
}

/// Standard container sheet header.
pub const CONTAINER_HEADERS: [&str; 7] = [
    "Container #",
    "Trade Type",
    "Holds",
    "Pregate Ticket#",
    "CurrentLoc",
    "Origin",
    "Destination",
];

/// A container row in `CONTAINER_HEADERS` order.
pub fn container_row<'a>(
    id: &'a str,
    trade: &'a str,
    holds: &'a str,
    pregate: &'a str,
    current_loc: &'a str,
) -> Vec<&'a str> {
    vec![id, trade, holds, pregate, current_loc, "TTI", "ITS"]
}

/// Bulk-info record for an import.
pub fn import_info(item_id: &str, pregate_passed: bool, timeline: &[(&str, &str)]) -> BulkImportInfo {
    BulkImportInfo {
        item_id: item_id.to_owned(),
        pregate_passed,
        timeline: timeline
            .iter()
            .map(|(milestone, date)| TimelineEntry {
                milestone: (*milestone).to_owned(),
                date: Some((*date).to_owned()),
            })
            .collect(),
    }
}

/// Bulk-info record for an export.
pub fn export_info(item_id: &str, booking_number: Option<&str>) -> BulkExportInfo {
    BulkExportInfo {
        item_id: item_id.to_owned(),
        booking_number: booking_number.map(str::to_owned),
    }
}

/// Install the two listing sheets on the fake upstream.
pub fn install_sheets(harness: &Harness, containers: Vec<u8>, appointments: Vec<u8>) {
    let mut script = harness.upstream.lock();
    script.downloads.insert(CONTAINERS_URL.to_owned(), containers);
    script
        .downloads
        .insert(APPOINTMENTS_URL.to_owned(), appointments);
    script.calendar_found = true;
}
