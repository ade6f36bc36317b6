//! Durable records: tenants and jobs.
//!
//! Row types and their SQLite string encodings live here; the stores in
//! [`tenants`] and [`jobs`] own all queries. Status strings follow the
//! `as_str`/`parse` pattern so invalid rows surface as typed errors instead
//! of silently wrong enums.

pub mod jobs;
pub mod tenants;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jobs::JobStore;
pub use tenants::TenantStore;

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row held a value outside the expected enum.
    #[error("invalid {field} value in store: {value}")]
    InvalidEnum {
        /// Column the value came from.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// Stats column held unparsable JSON.
    #[error("invalid summary stats: {0}")]
    InvalidStats(#[from] serde_json::Error),
    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// A managed user of the service with credentials against the upstream.
#[derive(Debug, Clone)]
pub struct Tenant {
    /// Stable integer id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Opaque bearer token for tenant API operations.
    pub auth_token: String,
    /// Root of this tenant's on-disk tree.
    pub root_path: PathBuf,
    /// Whether the scheduler ticks this tenant.
    pub schedule_enabled: bool,
    /// Minutes between scheduled harvests.
    pub frequency_minutes: u32,
    /// Currently known upstream session, if any.
    pub session_id: Option<String>,
}

impl Tenant {
    /// Path of this tenant's upstream credentials file.
    pub fn credentials_path(&self) -> PathBuf {
        self.root_path.join(".env")
    }
}

/// Upstream platform a job runs against.
///
/// Only one platform exists today; the tag is carried so job records stay
/// meaningful when more are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// The eModal port-community system.
    Emodal,
}

impl Platform {
    /// String stored in SQLite and used in artifact paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emodal => "emodal",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised platform.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "emodal" => Ok(Self::Emodal),
            other => Err(StoreError::InvalidEnum {
                field: "platform",
                value: other.to_owned(),
            }),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// Running; at most one per tenant.
    InProgress,
    /// Terminal: all stages finished.
    Completed,
    /// Terminal: failed or cancelled.
    Failed,
}

impl JobStatus {
    /// String stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }

    /// True for completed and failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Aggregated counters written when a job completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    /// Rows in the raw container listing.
    pub totals_list: u64,
    /// Rows surviving the stage-2 filter.
    pub totals_filtered: u64,
    /// Filtered rows with import trade type.
    pub totals_import: u64,
    /// Filtered rows with export trade type.
    pub totals_export: u64,
    /// Stage-4 probes that succeeded.
    pub probes_ok: u64,
    /// Stage-4 probes that terminally failed.
    pub probes_failed: u64,
    /// Rows in the raw appointment listing.
    pub total_appointments: u64,
    /// Wall-clock duration of the run in seconds.
    pub duration_seconds: u64,
}

/// One pipeline run for one tenant on one platform.
#[derive(Debug, Clone)]
pub struct Job {
    /// `q_{tenant_id}_{unix_seconds}`; the suffix is the job ordinal.
    pub query_id: String,
    /// Owning tenant.
    pub tenant_id: i64,
    /// Platform tag.
    pub platform: Platform,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Directory owned by this job, set when the run starts.
    pub folder_path: Option<PathBuf>,
    /// When the executor picked the job up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure reason.
    pub error_message: Option<String>,
    /// Counters, populated on completion.
    pub summary_stats: Option<SummaryStats>,
}

impl Job {
    /// The unix-second ordinal embedded in the query id.
    pub fn ordinal(&self) -> Option<i64> {
        parse_ordinal(&self.query_id)
    }
}

/// Build a query id from its parts.
pub fn format_query_id(tenant_id: i64, ordinal: i64) -> String {
    format!("q_{tenant_id}_{ordinal}")
}

/// Extract the unix-second ordinal from a `q_{tenant}_{unix}` query id.
///
/// Malformed ids yield `None`; callers treat that as "no newer job".
pub fn parse_ordinal(query_id: &str) -> Option<i64> {
    let suffix = query_id.rsplit('_').next()?;
    suffix.parse().ok()
}
