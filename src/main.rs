use anyhow::Context;
use clap::{Parser, Subcommand};
use ritel_sync::config::duration::parse_duration;
use ritel_sync::{mask_password, InitialSyncOutcome, StoreOpts, SyncEngine};
use ritel_sync_postgresql::PostgresStore;
use ritel_sync_sqlite::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ritel-sync")]
#[command(about = "Offline-first sync between a local SQLite store and central PostgreSQL")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    opts: StoreOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted
    Run,

    /// Show queue counts and remote reachability
    Stats,

    /// Refresh local tables from the remote store
    ForcePull {
        /// Refresh only this table
        #[arg(long)]
        table: Option<String>,
    },

    /// Queue every local row for a one-time full push
    InitialSync {
        /// Rerun even if the initial sync already completed
        #[arg(long)]
        force: bool,
    },

    /// Move failed operations back to pending
    ResetFailed,

    /// List the most recent failed operations
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete queued operations for backup and device-local tables
    PurgeIgnored,

    /// Delete synced operations older than a duration (e.g. "168h")
    Vacuum {
        #[arg(long, value_parser = parse_age)]
        older_than: Duration,
    },

    /// Install write-capture triggers on every syncable table
    InstallCapture,
}

fn parse_age(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| format!("{e:#}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ritel_sync=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli.opts).await?;

    match cli.command {
        Commands::Run => run_engine(&engine).await?,
        Commands::Stats => {
            engine.probe_health().await;
            let stats = engine.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::ForcePull { table } => {
            require_online(&engine).await?;
            match table {
                Some(table) => {
                    let refresh = engine
                        .pull_table(&table)
                        .await
                        .with_context(|| format!("Failed to refresh {table}"))?;
                    println!("{}", serde_json::to_string_pretty(&refresh)?);
                }
                None => {
                    let report = engine.trigger_force_pull().await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::InitialSync { force } => {
            require_online(&engine).await?;
            let outcome = engine.trigger_initial_sync(force).await?;
            if let InitialSyncOutcome::Queued { .. } = outcome {
                let report = engine.push_cycle().await?;
                info!("Pushed first batch: {} synced", report.synced);
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::ResetFailed => {
            let reset = engine.reset_failed().await?;
            println!("Reset {reset} failed operations");
        }
        Commands::Failed { limit } => {
            let failed = engine.failed_operations(limit).await?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
        }
        Commands::PurgeIgnored => {
            let purged = engine.purge_ignored().await?;
            println!("Purged {purged} operations");
        }
        Commands::Vacuum { older_than } => {
            let removed = engine.vacuum_synced(older_than).await?;
            println!("Removed {removed} synced operations");
        }
        Commands::InstallCapture => {
            let installed = engine.install_capture().await?;
            println!("Installed capture triggers on {installed} tables");
        }
    }

    Ok(())
}

async fn build_engine(opts: &StoreOpts) -> anyhow::Result<SyncEngine> {
    let config = opts
        .engine_config()
        .context("Failed to load engine configuration")?;

    let local = SqliteStore::open(&opts.sqlite_path).with_context(|| {
        format!("Failed to open SQLite store {}", opts.sqlite_path.display())
    })?;

    info!("Remote store: {}", mask_password(&opts.postgres_dsn));
    let remote = Arc::new(PostgresStore::new(opts.postgres_dsn.clone()));

    SyncEngine::new(local, remote, config)
        .await
        .context("Failed to initialize sync engine")
}

async fn require_online(engine: &SyncEngine) -> anyhow::Result<()> {
    if !engine.probe_health().await {
        anyhow::bail!("Remote store is not reachable");
    }
    Ok(())
}

async fn run_engine(engine: &SyncEngine) -> anyhow::Result<()> {
    engine.start();
    engine.log_queue_diagnostics().await?;

    // The health monitor probes on start; give it a moment before the
    // one-time initial sync check.
    let mut online = engine.online_changes();
    let _ = tokio::time::timeout(
        engine.config().remote_timeout,
        online.wait_for(|online| *online),
    )
    .await;

    if engine.is_online() {
        match engine.trigger_initial_sync(false).await {
            Ok(InitialSyncOutcome::AlreadyCompleted) => {}
            Ok(outcome) => info!("Initial sync: {outcome:?}"),
            Err(e) => warn!("Initial sync failed: {e}"),
        }
    } else {
        warn!("Remote store offline, working locally until it is reachable");
    }

    info!("Sync engine running (Press Ctrl+C to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Received shutdown signal");
    engine.shutdown().await;
    Ok(())
}
