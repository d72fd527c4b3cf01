//! Operation Log policy: what gets queued, and operator maintenance.

use chrono::Utc;
use std::time::Duration;
use sync_core::{Operation, Payload};
use tracing::{debug, info, warn};

use crate::engine::Context;
use crate::error::{Error, Result};

/// Failed operations listed by [`log_diagnostics`].
const DIAGNOSTIC_ITEMS: usize = 10;

pub(crate) async fn enqueue(
    ctx: &Context,
    table: &str,
    operation: Operation,
    record_key: &str,
    payload: Payload,
) -> Result<Option<i64>> {
    if !ctx.config.is_syncable(table) {
        debug!("Not queueing {operation} on excluded table {table}");
        return Ok(None);
    }

    let schema = ctx
        .schema_for(table)
        .await?
        .ok_or_else(|| Error::UnknownTable(table.to_string()))?;
    schema.validate(operation, &payload)?;

    let id = ctx
        .local
        .enqueue(
            table,
            operation,
            record_key,
            &payload,
            ctx.config.coalesce_pending,
        )
        .await?;
    debug!("Queued {operation} {table}/{record_key} as operation {id}");
    Ok(Some(id))
}

pub(crate) async fn reset_failed(ctx: &Context) -> Result<usize> {
    let reset = ctx.local.reset_failed().await?;
    info!("Reset {reset} failed operations to pending");
    Ok(reset)
}

pub(crate) async fn purge_ignored(ctx: &Context) -> Result<usize> {
    let mut purged = 0;
    for table in ctx.local.queued_tables().await? {
        if ctx.config.is_junk(&table) || ctx.config.is_device_local(&table) {
            let n = ctx.local.purge_queue_table(&table).await?;
            info!("Purged {n} queued operations for ignored table {table}");
            purged += n;
        }
    }
    Ok(purged)
}

pub(crate) async fn vacuum_synced(ctx: &Context, age: Duration) -> Result<usize> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
    let removed = ctx.local.vacuum_synced(Utc::now() - age).await?;
    if removed > 0 {
        info!("Vacuumed {removed} synced operations");
    }
    Ok(removed)
}

pub(crate) async fn log_diagnostics(ctx: &Context) -> Result<()> {
    let stats = ctx.local.queue_stats().await?;
    info!(
        "Queue stats: pending={}, synced={}, failed={}, online={}",
        stats.pending,
        stats.synced,
        stats.failed,
        ctx.is_online()
    );

    for op in ctx.local.failed_operations(DIAGNOSTIC_ITEMS).await? {
        warn!(
            "Failed operation {} ({} {}/{}): {}",
            op.id,
            op.operation,
            op.table,
            op.record_key,
            op.last_error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}
