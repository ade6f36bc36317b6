//! Periodic harvest scheduling.
//!
//! One process-wide scheduler owns a registry of per-tenant tick tasks,
//! keyed by tenant id. A tick enqueues a pipeline run only when the tenant
//! has no job in progress, so a slow run coalesces any ticks it overlaps.
//! Pause, resume, and frequency changes are registry mutations: the tick
//! task is aborted or re-armed, running jobs are never touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineExecutor;
use crate::store::{JobStore, Platform, StoreError, TenantStore};

/// Failures surfaced by scheduler mutations.
pub type SchedulerResult = Result<(), StoreError>;

struct Entry {
    frequency_minutes: u32,
    handle: JoinHandle<()>,
}

/// Process-wide scheduler over per-tenant tick tasks.
pub struct Scheduler {
    tenants: TenantStore,
    jobs: JobStore,
    executor: Arc<PipelineExecutor>,
    registry: Mutex<HashMap<i64, Entry>>,
}

impl Scheduler {
    /// Create a scheduler; call [`Scheduler::start`] to arm tenants.
    pub fn new(tenants: TenantStore, jobs: JobStore, executor: Arc<PipelineExecutor>) -> Arc<Self> {
        Arc::new(Self {
            tenants,
            jobs,
            executor,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a tick task for every tenant with scheduling enabled.
    ///
    /// # Errors
    ///
    /// Returns an error when the tenant listing fails.
    pub async fn start(&self) -> SchedulerResult {
        let tenants = self.tenants.list_scheduled().await?;
        info!(count = tenants.len(), "scheduler starting");
        for tenant in tenants {
            self.arm(tenant.id, tenant.frequency_minutes);
        }
        Ok(())
    }

    /// Disable the tenant's schedule and cancel its future ticks.
    ///
    /// A run already in flight is unaffected.
    ///
    /// # Errors
    ///
    /// Returns an error when the tenant is unknown or the update fails.
    pub async fn pause(&self, tenant_id: i64) -> SchedulerResult {
        self.tenants.set_schedule_enabled(tenant_id, false).await?;
        if let Some(entry) = self.lock_registry().remove(&tenant_id) {
            entry.handle.abort();
            info!(tenant_id, "schedule paused");
        }
        Ok(())
    }

    /// Re-enable the tenant's schedule and arm a tick task.
    ///
    /// # Errors
    ///
    /// Returns an error when the tenant is unknown or the update fails.
    pub async fn resume(&self, tenant_id: i64) -> SchedulerResult {
        self.tenants.set_schedule_enabled(tenant_id, true).await?;
        let tenant = self
            .tenants
            .get(tenant_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        self.arm(tenant_id, tenant.frequency_minutes);
        info!(tenant_id, frequency_minutes = tenant.frequency_minutes, "schedule resumed");
        Ok(())
    }

    /// Persist a new frequency and re-arm the tick task if one is active.
    ///
    /// # Errors
    ///
    /// Returns an error when the tenant is unknown or the update fails.
    pub async fn update_frequency(&self, tenant_id: i64, frequency_minutes: u32) -> SchedulerResult {
        let frequency_minutes = frequency_minutes.max(1);
        self.tenants.set_frequency(tenant_id, frequency_minutes).await?;
        if self.lock_registry().contains_key(&tenant_id) {
            self.arm(tenant_id, frequency_minutes);
            info!(tenant_id, frequency_minutes, "schedule frequency updated");
        }
        Ok(())
    }

    /// True when a tick task is currently armed for the tenant.
    pub fn is_armed(&self, tenant_id: i64) -> bool {
        self.lock_registry().contains_key(&tenant_id)
    }

    /// Abort every tick task. Running jobs are left to finish.
    pub fn shutdown(&self) {
        let mut registry = self.lock_registry();
        for (tenant_id, entry) in registry.drain() {
            entry.handle.abort();
            debug!(tenant_id, "tick task stopped");
        }
    }

    /// (Re)spawn the tick task for one tenant, replacing any existing one.
    ///
    /// The task owns clones of the job store and executor so the scheduler
    /// itself can be dropped without leaking a self-reference.
    fn arm(&self, tenant_id: i64, frequency_minutes: u32) {
        let jobs = self.jobs.clone();
        let executor = Arc::clone(&self.executor);
        let period = Duration::from_secs(u64::from(frequency_minutes.max(1)).saturating_mul(60));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Coalesce: a tick missed while a run was in flight does not
            // burst-fire afterwards.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate first tick; harvests start one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::tick(&jobs, &executor, tenant_id).await;
            }
        });

        let mut registry = self.lock_registry();
        if let Some(previous) = registry.insert(
            tenant_id,
            Entry {
                frequency_minutes,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// One tick: enqueue a run unless the tenant already has one in flight.
    async fn tick(jobs: &JobStore, executor: &Arc<PipelineExecutor>, tenant_id: i64) {
        match jobs.has_in_progress(tenant_id).await {
            Ok(true) => {
                debug!(tenant_id, "tick skipped, run already in progress");
            }
            Ok(false) => match jobs.create(tenant_id, Platform::Emodal).await {
                Ok(job) => {
                    info!(tenant_id, query_id = %job.query_id, "scheduled harvest enqueued");
                    let executor = Arc::clone(executor);
                    tokio::spawn(async move { executor.run(&job.query_id).await });
                }
                Err(e) => warn!(tenant_id, error = %e, "failed to enqueue scheduled harvest"),
            },
            Err(e) => warn!(tenant_id, error = %e, "tick could not query job state"),
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Armed frequency for a tenant, for the schedule read endpoint.
    pub fn armed_frequency(&self, tenant_id: i64) -> Option<u32> {
        self.lock_registry()
            .get(&tenant_id)
            .map(|entry| entry.frequency_minutes)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in registry.drain() {
            entry.handle.abort();
        }
    }
}
