//! Initial Sync: a one-time full push of every local row.
//!
//! Guarded by the `initial_sync_completed` flag in `sync_meta`. It runs
//! again when forced, or when the wipe indicator table is empty remotely
//! but not locally.

use serde::Serialize;
use sync_core::{record_key, Operation, Payload, RemoteStore, SqlValue};
use ritel_sync_sqlite::queue::META_INITIAL_SYNC_COMPLETED;
use tracing::{info, warn};

use crate::engine::Context;
use crate::error::{Error, Result};
use crate::sequence;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InitialSyncOutcome {
    /// The flag was set and nothing forced a rerun
    AlreadyCompleted,
    Queued {
        tables: usize,
        operations: usize,
        forced: bool,
    },
}

pub(crate) async fn trigger(ctx: &Context, force: bool) -> Result<InitialSyncOutcome> {
    if !ctx.is_online() {
        return Err(Error::RemoteNotConnected);
    }

    let completed = ctx.local.meta(META_INITIAL_SYNC_COMPLETED).await?.as_deref() == Some("1");
    let mut forced = force || ctx.config.force_resync;

    if completed && !forced {
        if !remote_wiped(ctx).await {
            return Ok(InitialSyncOutcome::AlreadyCompleted);
        }
        forced = true;
    }

    if forced {
        warn!("Force resync triggered (push local -> remote)");
    }
    info!("Starting initial sync (push local -> remote)");

    let mut tables = Vec::new();
    let mut operations = 0;
    for schema in ctx.refresh_registry().await? {
        if schema.primary_key.is_empty() {
            warn!("Skipping {}: no primary key", schema.name);
            continue;
        }

        let rows = ctx.local.read_rows(&schema.name, &schema.columns).await?;
        let key_positions: Vec<usize> = schema
            .primary_key
            .iter()
            .filter_map(|k| schema.columns.iter().position(|c| c == k))
            .collect();

        let mut queued = 0;
        for row in &rows {
            let key: Vec<SqlValue> = key_positions.iter().map(|&i| row[i].clone()).collect();
            if key.iter().any(SqlValue::is_null) {
                warn!("Skipping row of {} with a NULL key", schema.name);
                continue;
            }

            let payload: Payload = schema
                .columns
                .iter()
                .zip(row)
                .map(|(column, value)| (column.clone(), value.to_json()))
                .collect();
            ctx.local
                .enqueue(
                    &schema.name,
                    Operation::Insert,
                    &record_key(&key),
                    &payload,
                    ctx.config.coalesce_pending,
                )
                .await?;
            queued += 1;
        }

        if queued > 0 {
            info!("Table {}: queued {queued} rows for sync", schema.name);
        }
        operations += queued;
        tables.push(schema.name);
    }

    ctx.local.set_meta(META_INITIAL_SYNC_COMPLETED, "1").await?;

    let report = sequence::reconcile(ctx, &tables).await;
    if !report.failed.is_empty() {
        warn!("Failed to reset sequences for {:?}", report.failed);
    }

    info!("Initial sync queued: {operations} operations ready to push");
    Ok(InitialSyncOutcome::Queued {
        tables: tables.len(),
        operations,
        forced,
    })
}

/// Is the indicator table empty remotely while the local copy has rows?
/// Any error counts as no.
async fn remote_wiped(ctx: &Context) -> bool {
    let Some(table) = ctx.config.wipe_indicator_table.as_deref() else {
        return false;
    };

    let remote = match ctx.remote_call(ctx.remote.count_rows(table)).await {
        Ok(n) => n,
        Err(_) => return false,
    };
    let local = match ctx.local.count_rows(table).await {
        Ok(n) => n,
        Err(_) => return false,
    };

    if remote == 0 && local > 0 {
        warn!(
            "Remote {table} is empty while local has {local} rows, forcing resync"
        );
        return true;
    }
    false
}
