//! ritel-sync
//!
//! Offline-first replication between a point-of-sale's local SQLite
//! database and a central PostgreSQL database.
//!
//! # Overview
//!
//! - Every local write is recorded in an Operation Log (`sync_queue`) in the
//!   local database, either by the application through
//!   [`SyncEngine::enqueue`] or by capture triggers
//! - The Push Worker replays the log against the Remote Store as idempotent
//!   upserts and deletes, resolving natural-key conflicts
//! - The Pull Worker refreshes local tables from the Remote Store whenever
//!   the log is drained, letting local state win every conflict
//! - The Health Monitor tracks reachability; nothing blocks on it
//! - The Sequence Reconciler repairs remote auto-increment counters after
//!   rows with explicit keys were pushed
//!
//! # Store Crates
//!
//! - `sync_core` - shared value types, dialects and the `RemoteStore` trait
//! - `ritel_sync_sqlite` - the Local Store
//! - `ritel_sync_postgresql` - the Remote Store
//!
//! # CLI Usage
//!
//! ```bash
//! # Run the engine until Ctrl+C
//! ritel-sync --sqlite-path ./ritel.db --postgres-dsn postgresql://... run
//!
//! # Push every local row once more
//! ritel-sync initial-sync --force
//!
//! # Inspect and retry operations that ran out of retries
//! ritel-sync failed --limit 20
//! ritel-sync reset-failed
//! ```

use clap::Parser;
use std::path::PathBuf;

pub mod config;
pub mod engine;
pub mod error;
mod health;
pub mod initial_sync;
pub mod pull;
pub mod push;
mod queue;
pub mod sequence;

pub use config::{mask_password, ConflictRule, Dependent, EngineConfig};
pub use engine::{SyncEngine, SyncStats};
pub use error::{Error, Result};
pub use initial_sync::InitialSyncOutcome;
pub use pull::{PullReport, TableRefresh};
pub use push::PushReport;
pub use sequence::ReconcileReport;

/// Where the two stores live and how the engine is configured.
#[derive(Parser, Clone, Debug)]
pub struct StoreOpts {
    /// Local SQLite database file
    #[arg(long, default_value = "./ritel.db", env = "RITEL_SYNC_SQLITE_PATH")]
    pub sqlite_path: PathBuf,

    /// Central PostgreSQL connection string
    #[arg(long, env = "RITEL_SYNC_POSTGRES_DSN")]
    pub postgres_dsn: String,

    /// Engine configuration file (TOML)
    #[arg(long, env = "RITEL_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Rerun the initial full push even if it already completed
    #[arg(long, env = "RITEL_SYNC_FORCE_RESYNC")]
    pub force_resync: bool,
}

impl StoreOpts {
    /// The configuration file, or defaults, with command-line overrides.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        config.force_resync |= self.force_resync;
        Ok(config)
    }
}
