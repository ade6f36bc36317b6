//! Quayside service binary.
//!
//! `start` wires the full service: SQLite store, upstream client, session
//! manager, pipeline executor, scheduler, and the admin API. `trigger` runs
//! a single harvest inline for one tenant, and `schema` prints the SQL
//! schema for operators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use url::Url;

use quayside::config::{self, Config};
use quayside::pipeline::PipelineExecutor;
use quayside::scheduler::Scheduler;
use quayside::server::{self, AppState};
use quayside::session::{RetryPolicy, SessionManager};
use quayside::store::{JobStore, Platform, TenantStore};
use quayside::upstream::{HttpUpstreamClient, UpstreamApi};
use quayside::{db, logging};

#[derive(Debug, Parser)]
#[command(name = "quayside", about = "Multi-tenant harvest-pipeline service")]
struct Cli {
    /// Path to quayside.toml. Defaults to `{storage_root}/quayside.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service: scheduler plus admin API.
    Start,
    /// Run one harvest for a tenant and wait for it to finish.
    Trigger {
        /// Tenant id to harvest.
        #[arg(long)]
        tenant: i64,
    },
    /// Print the SQL schema and exit.
    Schema,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let mut defaults = Config::default();
            config::apply_env_overrides(&mut defaults)?;
            defaults.storage.root.join("quayside.toml")
        }
    };
    config::load_config(&path)
}

/// Shared service components behind the CLI subcommands.
struct Components {
    tenants: TenantStore,
    jobs: JobStore,
    executor: Arc<PipelineExecutor>,
}

async fn build_components(config: &Config) -> anyhow::Result<Components> {
    std::fs::create_dir_all(&config.storage.root).with_context(|| {
        format!(
            "failed to create storage root {}",
            config.storage.root.display()
        )
    })?;

    let pool = db::connect(&config.database_url()).await?;
    let tenants = TenantStore::new(pool.clone());
    let jobs = JobStore::new(pool);

    let base_url = Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream base url {}", config.upstream.base_url))?;
    let upstream: Arc<dyn UpstreamApi> =
        Arc::new(HttpUpstreamClient::new(base_url, config.upstream.timeout())?);

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&upstream),
        tenants.clone(),
        jobs.clone(),
        RetryPolicy::from_config(&config.session),
    ));
    let executor = Arc::new(PipelineExecutor::new(
        upstream,
        tenants.clone(),
        jobs.clone(),
        sessions,
        config.pipeline.clone(),
    ));

    Ok(Components {
        tenants,
        jobs,
        executor,
    })
}

async fn run_start(config: Config) -> anyhow::Result<()> {
    let components = build_components(&config).await?;
    let scheduler = Scheduler::new(
        components.tenants.clone(),
        components.jobs.clone(),
        Arc::clone(&components.executor),
    );
    scheduler.start().await?;

    let state = AppState::new(
        components.tenants,
        components.jobs,
        components.executor,
        Arc::clone(&scheduler),
        config.server.admin_secret.clone(),
    );

    tokio::select! {
        result = server::serve(state, &config.server.listen_addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Stop future ticks; in-flight runs observe their own cancellation points.
    scheduler.shutdown();
    Ok(())
}

async fn run_trigger(config: Config, tenant_id: i64) -> anyhow::Result<()> {
    let components = build_components(&config).await?;
    components
        .tenants
        .get(tenant_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown tenant {tenant_id}"))?;

    let job = components.jobs.create(tenant_id, Platform::Emodal).await?;
    info!(query_id = %job.query_id, "manual harvest starting");
    components.executor.run(&job.query_id).await;

    let finished = components
        .jobs
        .get(&job.query_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {} vanished", job.query_id))?;
    println!("{}: {}", finished.query_id, finished.status.as_str());
    if let Some(error) = finished.error_message {
        println!("error: {error}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Start => {
            let logs_dir = config.storage.root.join("logs");
            let _guard = logging::init_service(&logs_dir)?;
            info!(storage_root = %config.storage.root.display(), "quayside starting");
            run_start(config).await
        }
        Command::Trigger { tenant } => {
            logging::init_cli();
            run_trigger(config, tenant).await
        }
        Command::Schema => {
            println!("{}", db::SCHEMA.trim());
            Ok(())
        }
    }
}
