//! Job persistence.
//!
//! A job row is append-style: pending → in_progress → {completed | failed},
//! and never mutated after a terminal status. The in_progress transition
//! doubles as the per-tenant mutual exclusion point, and `find_newer` is the
//! primitive behind the newer-job cancellation rule.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::{format_query_id, parse_ordinal, Job, JobStatus, Platform, StoreError, SummaryStats};

type JobRow = (
    String,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

const SELECT_COLUMNS: &str = "query_id, tenant_id, platform, status, folder_path, \
                              started_at, completed_at, error_message, summary_stats";

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_job(row: JobRow) -> Result<Job, StoreError> {
    let (
        query_id,
        tenant_id,
        platform,
        status,
        folder_path,
        started_at,
        completed_at,
        error_message,
        summary_stats,
    ) = row;
    let summary_stats: Option<SummaryStats> = match summary_stats {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    Ok(Job {
        query_id,
        tenant_id,
        platform: Platform::parse(&platform)?,
        status: JobStatus::parse(&status)?,
        folder_path: folder_path.map(std::path::PathBuf::from),
        started_at: parse_timestamp(started_at),
        completed_at: parse_timestamp(completed_at),
        error_message,
        summary_stats,
    })
}

/// SQLite-backed job store.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: SqlitePool,
}

impl JobStore {
    /// Create a store over the given pool.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a pending job with a fresh, strictly monotonic query id.
    ///
    /// The ordinal is the current unix second, bumped past any existing
    /// ordinal for the tenant so two jobs created within one second still
    /// order strictly.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn create(&self, tenant_id: i64, platform: Platform) -> Result<Job, StoreError> {
        let mut ordinal = {
            let ids: Vec<(String,)> =
                sqlx::query_as("SELECT query_id FROM jobs WHERE tenant_id = ?1")
                    .bind(tenant_id)
                    .fetch_all(&self.db)
                    .await?;
            let max_existing = ids
                .iter()
                .filter_map(|(id,)| parse_ordinal(id))
                .max()
                .unwrap_or(0);
            Utc::now().timestamp().max(max_existing.saturating_add(1))
        };

        loop {
            let query_id = format_query_id(tenant_id, ordinal);
            let result = sqlx::query(
                "INSERT INTO jobs (query_id, tenant_id, platform, status) \
                 VALUES (?1, ?2, ?3, 'pending')",
            )
            .bind(&query_id)
            .bind(tenant_id)
            .bind(platform.as_str())
            .execute(&self.db)
            .await;

            match result {
                Ok(_) => {
                    debug!(query_id, tenant_id, "job created");
                    return self
                        .get(&query_id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound(query_id));
                }
                // Concurrent create for the same tenant landed on this
                // ordinal first; take the next second.
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    ordinal = ordinal.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Claim a pending job for execution.
    ///
    /// Succeeds only when the job is still pending AND the tenant has no
    /// other job in progress; this is the per-tenant mutual exclusion.
    /// Records `started_at` and the job's folder path.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn set_in_progress(
        &self,
        query_id: &str,
        folder_path: &Path,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'in_progress', started_at = ?2, folder_path = ?3 \
             WHERE query_id = ?1 AND status = 'pending' \
               AND NOT EXISTS (SELECT 1 FROM jobs other \
                               WHERE other.tenant_id = jobs.tenant_id \
                                 AND other.status = 'in_progress')",
        )
        .bind(query_id)
        .bind(Utc::now().to_rfc3339())
        .bind(folder_path.to_string_lossy().into_owned())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a job to its terminal state.
    ///
    /// Terminal rows are never touched again; finishing an already-terminal
    /// job is an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the job is unknown, already terminal, or the
    /// update fails.
    pub async fn finish(
        &self,
        query_id: &str,
        status: JobStatus,
        stats: Option<&SummaryStats>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let stats_json = match stats {
            Some(stats) => Some(serde_json::to_string(stats)?),
            None => None,
        };
        let result = sqlx::query(
            "UPDATE jobs SET status = ?2, completed_at = ?3, error_message = ?4, \
                             summary_stats = ?5 \
             WHERE query_id = ?1 AND status IN ('pending', 'in_progress')",
        )
        .bind(query_id)
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(error_message)
        .bind(stats_json)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "job {query_id} is unknown or already terminal"
            )));
        }
        debug!(query_id, status = status.as_str(), "job finished");
        Ok(())
    }

    /// Fetch a job by query id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is malformed.
    pub async fn get(&self, query_id: &str) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE query_id = ?1"))
                .bind(query_id)
                .fetch_optional(&self.db)
                .await?;
        row.map(row_to_job).transpose()
    }

    /// List a tenant's jobs, newest first, with an optional status filter.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is malformed.
    pub async fn list(
        &self,
        tenant_id: i64,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs \
                     WHERE tenant_id = ?1 AND status = ?2 \
                     ORDER BY query_id DESC LIMIT ?3 OFFSET ?4"
                ))
                .bind(tenant_id)
                .bind(status.as_str())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs WHERE tenant_id = ?1 \
                     ORDER BY query_id DESC LIMIT ?2 OFFSET ?3"
                ))
                .bind(tenant_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.db)
                .await?
            }
        };
        rows.into_iter().map(row_to_job).collect()
    }

    /// True when any job for the tenant has a strictly greater ordinal.
    ///
    /// Ids that fail to parse count as "not newer" so a malformed row can
    /// never cancel a healthy run.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn find_newer(&self, tenant_id: i64, ordinal: i64) -> Result<bool, StoreError> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT query_id FROM jobs WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_all(&self.db)
            .await?;
        Ok(ids
            .iter()
            .filter_map(|(id,)| parse_ordinal(id))
            .any(|other| other > ordinal))
    }

    /// True when the tenant currently has an in-progress job.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn has_in_progress(&self, tenant_id: i64) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM jobs WHERE tenant_id = ?1 AND status = 'in_progress' LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some())
    }
}
