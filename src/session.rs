//! Upstream session lifecycle per tenant.
//!
//! The session manager is the only writer of `tenant.session_id`. Sessions
//! are reused blindly until the upstream rejects one; recovery is always
//! explicit: persist null, then acquire. Acquisition prefers adopting a
//! session the upstream already holds for the username over a fresh login,
//! which costs a captcha solve upstream-side.
//!
//! When login answers 401 the manager waits out a long retry delay in
//! 60-second quanta, checking between quanta whether a newer job exists for
//! the tenant; if so the wait abandons with [`SessionError::CancelledByNewerJob`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::credentials;
use crate::store::{JobStore, StoreError, Tenant, TenantStore};
use crate::upstream::{UpstreamApi, UpstreamError};

/// Default spacing of cancellation checks inside the retry wait.
pub const DEFAULT_CANCEL_POLL: Duration = Duration::from_secs(60);

/// Session acquisition failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Upstream call failed with a classified error.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// A newer job for the tenant appeared during the retry wait.
    #[error("cancelled by newer job")]
    CancelledByNewerJob,
    /// Store read/write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The tenant's credentials file is missing or unreadable.
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    /// The tenant row disappeared.
    #[error("unknown tenant {0}")]
    UnknownTenant(i64),
}

/// Retry policy for 401s during acquisition.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total acquisition attempts.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub retry_delay: Duration,
    /// Quantum between cancellation checks inside the wait.
    pub cancel_poll: Duration,
}

impl RetryPolicy {
    /// Build the production policy from config.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.acquire_max_retries.max(1),
            retry_delay: config.retry_delay(),
            cancel_poll: DEFAULT_CANCEL_POLL,
        }
    }
}

/// Obtains, reuses, invalidates, and recreates upstream sessions.
pub struct SessionManager {
    upstream: Arc<dyn UpstreamApi>,
    tenants: TenantStore,
    jobs: JobStore,
    policy: RetryPolicy,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        tenants: TenantStore,
        jobs: JobStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            upstream,
            tenants,
            jobs,
            policy,
        }
    }

    /// Return the tenant's current session, acquiring one only if none is
    /// persisted. The persisted id is trusted without an upstream call.
    ///
    /// `job_ordinal` scopes the newer-job cancellation check during a
    /// potential acquisition wait.
    ///
    /// # Errors
    ///
    /// Returns an error when acquisition fails or is cancelled.
    pub async fn ensure(
        &self,
        tenant_id: i64,
        job_ordinal: Option<i64>,
    ) -> Result<String, SessionError> {
        let tenant = self.fetch(tenant_id).await?;
        if let Some(session) = tenant.session_id.clone() {
            debug!(tenant_id, "reusing persisted session");
            return Ok(session);
        }
        self.acquire(&tenant, job_ordinal).await
    }

    /// Drop the tenant's session and acquire a fresh one.
    ///
    /// The null is persisted before any upstream call so a crash between the
    /// two steps leaves the tenant session-less rather than pointing at a
    /// dead session.
    ///
    /// # Errors
    ///
    /// Returns an error when acquisition fails or is cancelled.
    pub async fn recover(
        &self,
        tenant_id: i64,
        job_ordinal: Option<i64>,
    ) -> Result<String, SessionError> {
        info!(tenant_id, "recovering upstream session");
        self.tenants.set_session(tenant_id, None).await?;
        let tenant = self.fetch(tenant_id).await?;
        self.acquire(&tenant, job_ordinal).await
    }

    async fn fetch(&self, tenant_id: i64) -> Result<Tenant, SessionError> {
        self.tenants
            .get(tenant_id)
            .await?
            .ok_or(SessionError::UnknownTenant(tenant_id))
    }

    /// Acquisition: adopt an already-active session, else log in, retrying
    /// 401s on the cancelable backoff.
    async fn acquire(
        &self,
        tenant: &Tenant,
        job_ordinal: Option<i64>,
    ) -> Result<String, SessionError> {
        let creds = credentials::load_credentials(&tenant.credentials_path())
            .map_err(|e| SessionError::Credentials(e.to_string()))?;

        let mut attempt: u32 = 1;
        loop {
            match self.upstream.list_active_sessions(&creds.username).await {
                Ok(sessions) => {
                    if let Some(session) = sessions.into_iter().next() {
                        info!(tenant_id = tenant.id, "adopting active upstream session");
                        self.tenants.set_session(tenant.id, Some(&session)).await?;
                        return Ok(session);
                    }
                }
                // The listing is an optimization; a failed lookup falls
                // through to a regular login.
                Err(e) => {
                    warn!(tenant_id = tenant.id, error = %e, "active-session lookup failed");
                }
            }

            match self.upstream.acquire_session(&creds).await {
                Ok(acquired) => {
                    info!(
                        tenant_id = tenant.id,
                        reused = acquired.reused,
                        "upstream session acquired"
                    );
                    self.tenants
                        .set_session(tenant.id, Some(&acquired.session_id))
                        .await?;
                    return Ok(acquired.session_id);
                }
                Err(UpstreamError::AuthInvalid(msg)) if attempt < self.policy.max_attempts => {
                    warn!(
                        tenant_id = tenant.id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %msg,
                        "login rejected, waiting before retry"
                    );
                    self.cancelable_wait(tenant.id, job_ordinal).await?;
                    attempt = attempt.saturating_add(1);
                }
                // Final 401 or any other class fails immediately.
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sleep out the retry delay in quanta, abandoning when a newer job for
    /// the tenant appears.
    async fn cancelable_wait(
        &self,
        tenant_id: i64,
        job_ordinal: Option<i64>,
    ) -> Result<(), SessionError> {
        let mut remaining = self.policy.retry_delay;
        while !remaining.is_zero() {
            let quantum = remaining.min(self.policy.cancel_poll);
            tokio::time::sleep(quantum).await;
            remaining = remaining.saturating_sub(quantum);
            if let Some(ordinal) = job_ordinal {
                if self.jobs.find_newer(tenant_id, ordinal).await? {
                    info!(tenant_id, ordinal, "retry wait abandoned for newer job");
                    return Err(SessionError::CancelledByNewerJob);
                }
            }
        }
        Ok(())
    }
}
