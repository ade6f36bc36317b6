//! SQLite pool construction and schema.
//!
//! All durable records (tenants and jobs) live in one SQLite database. Writes
//! are short independent transactions; nothing holds a transaction across an
//! upstream call.

use std::str::FromStr;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Schema applied idempotently at startup.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id                INTEGER PRIMARY KEY,
    name              TEXT NOT NULL,
    auth_token        TEXT NOT NULL UNIQUE,
    root_path         TEXT NOT NULL,
    schedule_enabled  INTEGER NOT NULL DEFAULT 0,
    frequency_minutes INTEGER NOT NULL DEFAULT 60,
    session_id        TEXT,
    created_at        TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS jobs (
    query_id      TEXT PRIMARY KEY,
    tenant_id     INTEGER NOT NULL REFERENCES tenants(id),
    platform      TEXT NOT NULL,
    status        TEXT NOT NULL,
    folder_path   TEXT,
    started_at    TEXT,
    completed_at  TEXT,
    error_message TEXT,
    summary_stats TEXT,
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON jobs(tenant_id, status);
"#;

/// Open (creating if missing) the database at the given SQLite DSN and
/// apply the schema.
///
/// # Errors
///
/// Returns an error when the DSN is invalid, the file cannot be opened, or
/// the schema fails to apply.
pub async fn connect(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url: {url}"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {url}"))?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Open a fresh in-memory database with the schema applied.
///
/// Single-connection, and never reaped: each SQLite memory connection is its
/// own database, so closing the idle connection would drop the data.
///
/// # Errors
///
/// Returns an error when the pool cannot be created.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("failed to build in-memory options")?;
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply [`SCHEMA`] statement by statement.
///
/// # Errors
///
/// Returns an error when a statement fails.
pub async fn apply_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to apply schema statement: {statement}"))?;
    }
    Ok(())
}
