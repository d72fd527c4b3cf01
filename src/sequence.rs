//! Sequence Reconciler.
//!
//! Pushed rows carry explicit keys, so the Remote Store's auto-increment
//! counters never see them. Resetting each counter past `MAX(key)` keeps a
//! later remote-native insert from reusing a pushed key.

use serde::Serialize;
use sync_core::StoreError;
use tracing::{debug, info, warn};

use crate::engine::Context;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub reset: Vec<String>,
    /// Counters widened to 64 bits before the reset succeeded
    pub widened: Vec<String>,
    /// Tables with no counter to reset: text or composite keys, no remote
    /// table, or the engine offline
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Reconcile `tables`, or every syncable table when `tables` is empty.
/// A failure on one table never stops the others.
pub(crate) async fn reconcile(ctx: &Context, tables: &[String]) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let tables = if tables.is_empty() {
        match ctx.syncable_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Failed to list tables for sequence reconciliation: {e}");
                return report;
            }
        }
    } else {
        tables.to_vec()
    };

    for table in tables {
        if !ctx.config.is_syncable(&table) || !ctx.is_online() {
            report.skipped.push(table);
            continue;
        }

        let key = match ctx.schema_for(&table).await {
            Ok(Some(schema)) => schema.single_key().map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                warn!("Cannot read schema of {table}: {e}");
                report.failed.push((table, e.to_string()));
                continue;
            }
        };
        let Some(key) = key else {
            report.skipped.push(table);
            continue;
        };

        match reconcile_table(ctx, &table, &key).await {
            Ok(Outcome::Reset) => report.reset.push(table),
            Ok(Outcome::Widened) => {
                report.widened.push(table.clone());
                report.reset.push(table);
            }
            Ok(Outcome::NoSequence) => report.skipped.push(table),
            Err(e) => {
                warn!("Could not reset sequence for {table}: {e}");
                if e.is_connectivity() {
                    ctx.request_probe();
                }
                report.failed.push((table, e.to_string()));
            }
        }
    }

    if !report.reset.is_empty() {
        debug!("Sequences reset for {:?}", report.reset);
    }
    report
}

enum Outcome {
    Reset,
    Widened,
    NoSequence,
}

async fn reconcile_table(ctx: &Context, table: &str, key: &str) -> Result<Outcome, StoreError> {
    let Some(columns) = ctx.remote_call(ctx.remote.columns_of(table)).await? else {
        return Ok(Outcome::NoSequence);
    };
    let Some(key) = ctx.aliases.resolve(key, &columns) else {
        return Ok(Outcome::NoSequence);
    };

    match ctx.remote_call(ctx.remote.reset_sequence(table, &key)).await {
        Ok(()) => Ok(Outcome::Reset),
        Err(StoreError::NonNumericKey(_)) => Ok(Outcome::NoSequence),
        Err(StoreError::SequenceOverflow(message)) => {
            warn!("Sequence overflow for {table} ({message}), upgrading to BIGINT");
            ctx.remote_call(ctx.remote.widen_sequence(table, &key)).await?;
            ctx.remote_call(ctx.remote.reset_sequence(table, &key)).await?;
            info!("Upgraded and reset sequence for {table}");
            Ok(Outcome::Widened)
        }
        Err(e) => Err(e),
    }
}
