//! Pull / Bootstrap Worker: refreshes the Local Store from the Remote Store.
//!
//! Each table is refreshed in its own local transaction. Local wins every
//! conflict: a pulled row that violates a local constraint is skipped, and a
//! row with unpushed local changes is never overwritten.

use serde::Serialize;
use sync_core::{select_sql, timestamp, ColumnMapping, Row, StoreError};
use tracing::{debug, info, warn};

use crate::engine::Context;
use crate::error::{Error, Result};

/// Result of refreshing one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRefresh {
    pub table: String,
    pub fetched: usize,
    pub applied: usize,
    /// Rows rejected by a local constraint
    pub conflicts: usize,
    /// Rows kept local because they have unpushed operations
    pub preserved: usize,
}

/// What one pull pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub tables: Vec<TableRefresh>,
    /// Tables without a primary key or without a remote counterpart
    pub skipped: Vec<String>,
    /// Tables whose refresh failed, with the error
    pub failed: Vec<(String, String)>,
    /// The Remote Store became unreachable mid-pass
    pub interrupted: bool,
}

pub(crate) async fn pull_cycle(ctx: &Context) -> Result<PullReport> {
    if !ctx.is_online() {
        return Err(Error::RemoteNotConnected);
    }

    let _replication = ctx.replication.lock().await;
    let mut report = PullReport::default();

    for table in ctx.syncable_tables().await? {
        match refresh(ctx, &table).await {
            Ok(Some(refresh)) => report.tables.push(refresh),
            Ok(None) => report.skipped.push(table),
            Err(Error::Store(e)) if e.is_connectivity() => {
                warn!("Remote store unreachable during pull of {table}: {e}");
                report.failed.push((table, e.to_string()));
                report.interrupted = true;
                ctx.request_probe();
                break;
            }
            Err(e) => {
                warn!("Failed to refresh {table}, continuing: {e}");
                report.failed.push((table, e.to_string()));
            }
        }
    }

    let applied: usize = report.tables.iter().map(|t| t.applied).sum();
    if applied > 0 || !report.failed.is_empty() {
        info!(
            "Pulled {applied} rows into {} tables ({} failed)",
            report.tables.len(),
            report.failed.len()
        );
    }
    Ok(report)
}

pub(crate) async fn pull_table(ctx: &Context, table: &str) -> Result<TableRefresh> {
    if !ctx.config.is_syncable(table) {
        return Err(Error::ExcludedTable(table.to_string()));
    }
    if !ctx.is_online() {
        return Err(Error::RemoteNotConnected);
    }

    let _replication = ctx.replication.lock().await;
    refresh(ctx, table)
        .await?
        .ok_or_else(|| Error::UnknownTable(table.to_string()))
}

/// Refresh one table. `None` when it cannot be pulled: no local key, or no
/// remote table.
async fn refresh(ctx: &Context, table: &str) -> Result<Option<TableRefresh>> {
    let Some(schema) = ctx
        .local
        .table_schema(table)
        .await
        .map_err(|e| local_error(table, e))?
    else {
        return Ok(None);
    };
    if schema.primary_key.is_empty() {
        debug!("Not pulling {table}: no primary key");
        return Ok(None);
    }

    let Some(remote_columns) = ctx.remote_call(ctx.remote.columns_of(table)).await? else {
        debug!("Not pulling {table}: no remote table");
        return Ok(None);
    };

    let mapping = ColumnMapping::build(
        schema.columns.iter().map(String::as_str),
        &remote_columns,
        &ctx.aliases,
    );
    if let Some(key) = schema
        .primary_key
        .iter()
        .find(|k| mapping.remote_for(k).is_none())
    {
        warn!("Not pulling {table}: key column {key} has no remote counterpart");
        return Ok(None);
    }

    let sql = select_sql(ctx.remote.dialect(), table, &mapping.remote_columns());
    let rows: Vec<Row> = ctx
        .remote_call(ctx.remote.query(&sql, &[]))
        .await?
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|value| timestamp::normalize(value, ctx.timezone))
                .collect()
        })
        .collect();

    let fetched = rows.len();
    let preserve = ctx
        .local
        .unresolved_keys(table)
        .await
        .map_err(|e| local_error(table, e))?;
    let outcome = ctx
        .local
        .refresh_table(
            table,
            &mapping.local_columns(),
            &schema.primary_key,
            rows,
            preserve,
        )
        .await
        .map_err(|e| local_error(table, e))?;

    if outcome.conflicts > 0 {
        debug!("Skipped {} conflicting rows in {table}", outcome.conflicts);
    }

    Ok(Some(TableRefresh {
        table: table.to_string(),
        fetched,
        applied: outcome.applied,
        conflicts: outcome.conflicts,
        preserved: outcome.preserved,
    }))
}

/// A local failure must not look like the Remote Store going away.
fn local_error(table: &str, e: StoreError) -> Error {
    match e {
        StoreError::Connectivity(message) => {
            Error::Store(StoreError::Other(format!(
                "local store unavailable refreshing {table}: {message}"
            )))
        }
        other => Error::Store(other),
    }
}
