// src/main.rs
//
// =============================================================================
// MARLIN-SUPER: ENTRY POINT (v 0.1)
// =============================================================================
//
// The wiring center: parses CLI/config, builds a gateway backend, boots a
// Supervisor, and serves introspection on demand. Grounded on `main.rs`'s
// `#[tokio::main]` + `env_logger::Builder::from_env` + `clap::Subcommand`
// dispatch shape; the Start/Deploy/Tui subcommands are replaced with the
// ones a job supervisor actually needs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod config;
mod error;
mod introspection;
mod job;
mod locate;
mod mds;
mod model;
mod planner;
mod supervisor;

use crate::config::SupervisorConfig;
use crate::locate::{LocateService, StaticLocate};
use crate::mds::memory::InMemoryMds;
use crate::mds::sqlite::SqliteMds;
use crate::mds::MdsGateway;
use crate::model::JobRecord;
use crate::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "marlin-superd",
    version,
    about = "Distributed job supervisor for a multi-phase batch compute engine"
)]
struct Cli {
    /// Path to a JSON config file (§6). CLI flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Supervisor identity used in conditional writes (§6). Overrides the
    /// config file and the generated default.
    #[arg(long)]
    uuid: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor against a durable (SQLite-backed) MDS.
    Run {
        /// Path to the MDS database file.
        #[arg(long, default_value = "marlin-super.db")]
        db: PathBuf,
    },
    /// Run the supervisor against an in-memory MDS, seeding the given job
    /// definitions from a JSON file (an array of job records). Useful for
    /// local smoke tests; real deployments always use `run`.
    RunMemory {
        /// Path to a JSON file containing an array of job records to seed.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    };
    if let Some(uuid) = cli.uuid {
        config.uuid = uuid;
    }

    match cli.command {
        Commands::Run { db } => run_with_sqlite(config, db).await,
        Commands::RunMemory { seed } => run_with_memory(config, seed).await,
    }
}

async fn run_with_sqlite(config: SupervisorConfig, db: PathBuf) -> Result<()> {
    let staleness_ms = config.staleness_ms;
    let gateway: Arc<dyn MdsGateway> = Arc::new(
        SqliteMds::open(&db, staleness_ms)
            .map_err(|e| anyhow::anyhow!("opening mds database {}: {e}", db.display()))?,
    );
    let locate: Arc<dyn LocateService> = Arc::new(StaticLocate::empty());

    log::info!(
        "marlin-superd {} starting against {} (tick={}ms, find={}ms)",
        config.uuid,
        db.display(),
        config.tick_interval_ms,
        config.find_interval_ms,
    );

    serve(config, gateway, locate).await
}

async fn run_with_memory(config: SupervisorConfig, seed: Option<PathBuf>) -> Result<()> {
    let mem = InMemoryMds::new(config.staleness());
    if let Some(path) = seed {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let records: Vec<JobRecord> = serde_json::from_str(&text)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        for record in records {
            mem.put_job(record).await;
        }
    }
    let gateway: Arc<dyn MdsGateway> = Arc::new(mem);
    let locate: Arc<dyn LocateService> = Arc::new(StaticLocate::empty());

    log::info!(
        "marlin-superd {} starting against in-memory MDS (tick={}ms, find={}ms)",
        config.uuid,
        config.tick_interval_ms,
        config.find_interval_ms,
    );

    serve(config, gateway, locate).await
}

async fn serve(
    config: SupervisorConfig,
    gateway: Arc<dyn MdsGateway>,
    locate: Arc<dyn LocateService>,
) -> Result<()> {
    let supervisor = Supervisor::new(config.clone(), gateway, locate);
    supervisor.start();

    let mut find_ticker = tokio::time::interval(config.find_interval());
    let status_sup = supervisor.clone();
    tokio::spawn(async move {
        loop {
            find_ticker.tick().await;
            let snapshot = status_sup.snapshot().await;
            log::info!(
                "worker {} owns {}/{} jobs",
                snapshot.worker.uuid,
                snapshot.worker.owned_job_count,
                snapshot.worker.owned_job_cap,
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::warn!("interrupt received, shutting down");
    Ok(())
}
