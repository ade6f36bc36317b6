//! Tenant persistence.
//!
//! Tenant provisioning itself is an operator concern; this store exists so
//! the engine can look tenants up, flip their schedules, and persist the
//! upstream session id the session manager owns.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tracing::debug;

use super::{StoreError, Tenant};

type TenantRow = (i64, String, String, String, bool, i64, Option<String>);

fn row_to_tenant(row: TenantRow) -> Tenant {
    let (id, name, auth_token, root_path, schedule_enabled, frequency_minutes, session_id) = row;
    Tenant {
        id,
        name,
        auth_token,
        root_path: PathBuf::from(root_path),
        schedule_enabled,
        frequency_minutes: u32::try_from(frequency_minutes).unwrap_or(1).max(1),
        session_id,
    }
}

const SELECT_COLUMNS: &str = "id, name, auth_token, root_path, schedule_enabled, \
                              frequency_minutes, session_id";

/// SQLite-backed tenant store.
#[derive(Debug, Clone)]
pub struct TenantStore {
    db: SqlitePool,
}

impl TenantStore {
    /// Create a store over the given pool.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert a tenant row.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails (duplicate id or token).
    pub async fn create(
        &self,
        id: i64,
        name: &str,
        auth_token: &str,
        root_path: &Path,
        frequency_minutes: u32,
    ) -> Result<Tenant, StoreError> {
        sqlx::query(
            "INSERT INTO tenants (id, name, auth_token, root_path, schedule_enabled, frequency_minutes) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(id)
        .bind(name)
        .bind(auth_token)
        .bind(root_path.to_string_lossy().into_owned())
        .bind(i64::from(frequency_minutes.max(1)))
        .execute(&self.db)
        .await?;

        debug!(tenant_id = id, name, "tenant created");
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("tenant {id}")))
    }

    /// Fetch a tenant by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get(&self, id: i64) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM tenants WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(row_to_tenant))
    }

    /// Fetch a tenant by its bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_by_token(&self, token: &str) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tenants WHERE auth_token = ?1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(row_to_tenant))
    }

    /// All tenants with scheduling enabled, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn list_scheduled(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tenants WHERE schedule_enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(row_to_tenant).collect())
    }

    /// Persist the tenant's upstream session id (or clear it with `None`).
    ///
    /// Only the session manager calls this.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails or the tenant is unknown.
    pub async fn set_session(&self, tenant_id: i64, session: Option<&str>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tenants SET session_id = ?1 WHERE id = ?2")
            .bind(session)
            .bind(tenant_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        debug!(tenant_id, present = session.is_some(), "tenant session updated");
        Ok(())
    }

    /// Enable or disable the tenant's schedule.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails or the tenant is unknown.
    pub async fn set_schedule_enabled(
        &self,
        tenant_id: i64,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tenants SET schedule_enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(tenant_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }

    /// Update the tenant's harvest frequency (floored at one minute).
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails or the tenant is unknown.
    pub async fn set_frequency(
        &self,
        tenant_id: i64,
        frequency_minutes: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tenants SET frequency_minutes = ?1 WHERE id = ?2")
            .bind(i64::from(frequency_minutes.max(1)))
            .bind(tenant_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }
}
