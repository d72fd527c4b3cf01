//! Push Worker: replays the Operation Log against the Remote Store.
//!
//! Inserts and updates become a keyed upsert, deletes a keyed delete, so
//! replaying an operation twice leaves the remote row unchanged. Payload
//! columns the remote table lacks are dropped before the statement is
//! built.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use sync_core::{
    delete_sql, timestamp, upsert_sql, ColumnMapping, OpStatus, Operation, SqlValue, StoreError,
    SyncOperation, TableSchema, KEY_SEPARATOR,
};
use tracing::{debug, error, info, warn};

use crate::config::ConflictRule;
use crate::engine::Context;
use crate::error::Result;
use crate::queue;

/// What one push cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub synced: usize,
    /// Failed attempts with retries left
    pub retried: usize,
    /// Operations that exhausted their retry budget
    pub failed: usize,
    /// Operations on excluded tables, marked synced without a remote call
    pub ignored: usize,
    /// Pushed, but a newer write was coalesced in meanwhile
    pub superseded: usize,
    pub conflicts_resolved: usize,
    /// The Remote Store became unreachable mid-batch
    pub interrupted: bool,
    /// Tables that received at least one successful write
    pub tables: Vec<String>,
}

/// Live remote column sets, looked up once per table per cycle.
type ColumnCache = HashMap<String, BTreeSet<String>>;

pub(crate) async fn push_cycle(ctx: &Context) -> Result<PushReport> {
    let mut report = PushReport::default();
    if !ctx.is_online() {
        return Ok(report);
    }

    let _replication = ctx.replication.lock().await;
    let ops = ctx.local.pending_operations(ctx.config.batch_size).await?;
    let mut columns = ColumnCache::new();
    let mut affected = BTreeSet::new();

    for op in &ops {
        if !ctx.config.is_syncable(&op.table) {
            ctx.local.mark_synced(op).await?;
            report.ignored += 1;
            continue;
        }

        let Some(schema) = ctx.schema_for(&op.table).await? else {
            record_failure(ctx, op, &format!("unknown local table {}", op.table), &mut report)
                .await?;
            continue;
        };

        match push_one(ctx, &schema, op, &mut columns).await {
            Ok(resolved) => {
                if resolved {
                    report.conflicts_resolved += 1;
                }
                affected.insert(op.table.clone());
                if ctx.local.mark_synced(op).await? {
                    report.synced += 1;
                } else {
                    debug!("Operation {} changed while in flight, will push again", op.id);
                    report.superseded += 1;
                }
            }
            Err(e) if e.is_connectivity() => {
                // A slow statement also lands here; only a failed ping
                // means the store is really gone.
                if ctx.remote_call(ctx.remote.ping()).await.is_ok() {
                    record_failure(ctx, op, &e.to_string(), &mut report).await?;
                    continue;
                }
                warn!("Remote store unreachable, pausing push: {e}");
                report.interrupted = true;
                ctx.request_probe();
                break;
            }
            Err(e) => record_failure(ctx, op, &e.to_string(), &mut report).await?,
        }
    }

    if report.synced + report.retried + report.failed > 0 {
        info!(
            "Batch synced: {} success, {} retrying, {} failed",
            report.synced, report.retried, report.failed
        );
    }

    report.tables = affected.into_iter().collect();
    if report.synced > 0 {
        ctx.schedule_reconcile(report.tables.clone());
    }

    if let Some(retention) = ctx.config.synced_retention {
        queue::vacuum_synced(ctx, retention).await?;
    }

    Ok(report)
}

async fn record_failure(
    ctx: &Context,
    op: &SyncOperation,
    message: &str,
    report: &mut PushReport,
) -> Result<()> {
    match ctx
        .local
        .mark_failed(op, message, ctx.config.max_retries)
        .await?
    {
        OpStatus::Failed => {
            error!(
                "Giving up on operation {} ({} {}/{}): {message}",
                op.id, op.operation, op.table, op.record_key
            );
            report.failed += 1;
        }
        _ => {
            warn!(
                "Failed to execute operation {} ({} {}): {message}",
                op.id, op.operation, op.table
            );
            report.retried += 1;
        }
    }
    Ok(())
}

/// Apply one operation. Returns true when a natural-key conflict had to be
/// resolved first.
async fn push_one(
    ctx: &Context,
    schema: &TableSchema,
    op: &SyncOperation,
    cache: &mut ColumnCache,
) -> Result<bool, StoreError> {
    if schema.primary_key.is_empty() {
        return Err(StoreError::Other(format!("{} has no primary key", op.table)));
    }

    let remote_columns = match cache.get(&op.table) {
        Some(columns) => columns.clone(),
        None => {
            let columns = ctx
                .remote_call(ctx.remote.columns_of(&op.table))
                .await?
                .ok_or_else(|| StoreError::UndefinedTable(op.table.clone()))?;
            cache.insert(op.table.clone(), columns.clone());
            columns
        }
    };

    match op.operation {
        Operation::Insert | Operation::Update => upsert(ctx, schema, op, &remote_columns).await,
        Operation::Delete => delete(ctx, schema, op, &remote_columns).await.map(|()| false),
    }
}

async fn upsert(
    ctx: &Context,
    schema: &TableSchema,
    op: &SyncOperation,
    remote_columns: &BTreeSet<String>,
) -> Result<bool, StoreError> {
    let mapping = ColumnMapping::build(
        op.payload.keys().map(String::as_str),
        remote_columns,
        &ctx.aliases,
    );
    if !mapping.dropped().is_empty() {
        debug!(
            "Dropping columns {:?} unknown to remote {}",
            mapping.dropped(),
            op.table
        );
    }

    let key_columns = schema
        .primary_key
        .iter()
        .map(|k| {
            mapping.remote_for(k).map(str::to_string).ok_or_else(|| {
                StoreError::Other(format!("key column {}.{k} cannot be mapped", op.table))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let values: Vec<SqlValue> = mapping
        .pairs()
        .iter()
        .map(|(local, _)| {
            let value = op
                .payload
                .get(local)
                .map(SqlValue::from_json)
                .unwrap_or(SqlValue::Null);
            timestamp::normalize(value, ctx.timezone)
        })
        .collect();

    let sql = upsert_sql(
        ctx.remote.dialect(),
        &op.table,
        &mapping.remote_columns(),
        &key_columns,
    );

    match ctx.remote_call(ctx.remote.execute(&sql, &values)).await {
        Ok(_) => Ok(false),
        Err(e) if e.is_unique_violation() => {
            let Some(rule) = ctx.config.conflict_rule(&op.table) else {
                return Err(e);
            };
            info!("Conflict detected for {} {}, attempting to resolve", op.table, op.record_key);
            if !resolve_conflict(ctx, rule, schema, &mapping, op).await? {
                return Err(e);
            }
            ctx.remote_call(ctx.remote.execute(&sql, &values)).await?;
            info!("Conflict resolved for {} {}", op.table, op.record_key);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Delete the remote row that holds `op`'s natural key under a different
/// primary key, children first. Returns false when there is nothing to
/// delete, so the original error stands.
async fn resolve_conflict(
    ctx: &Context,
    rule: &ConflictRule,
    schema: &TableSchema,
    mapping: &ColumnMapping,
    op: &SyncOperation,
) -> Result<bool, StoreError> {
    let Some(natural) = op.payload.get(&rule.natural_key).filter(|v| !v.is_null()) else {
        return Ok(false);
    };
    let Some(key) = schema.single_key() else {
        return Ok(false);
    };
    let (Some(remote_key), Some(remote_natural)) =
        (mapping.remote_for(key), mapping.remote_for(&rule.natural_key))
    else {
        return Ok(false);
    };

    let dialect = ctx.remote.dialect();
    let lookup = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        dialect.quote_ident(remote_key),
        dialect.quote_ident(&op.table),
        dialect.quote_ident(remote_natural),
        dialect.placeholder(1)
    );
    let natural = SqlValue::from_json(natural);
    let rows = ctx
        .remote_call(ctx.remote.query(&lookup, std::slice::from_ref(&natural)))
        .await?;

    let local_key = op
        .payload
        .get(key)
        .map(|v| SqlValue::from_json(v).to_key_string());

    let mut resolved = false;
    for remote_id in rows.into_iter().filter_map(|row| row.into_iter().next()) {
        if local_key.as_deref() == Some(remote_id.to_key_string().as_str()) {
            continue;
        }

        warn!(
            "Deleting conflicting remote {} {remote_id} ({natural}) to allow sync",
            op.table
        );
        for dependent in &rule.dependents {
            let sql = format!(
                "DELETE FROM {} WHERE {} = {}",
                dialect.quote_ident(&dependent.table),
                dialect.quote_ident(&dependent.column),
                dialect.placeholder(1)
            );
            match ctx
                .remote_call(ctx.remote.execute(&sql, std::slice::from_ref(&remote_id)))
                .await
            {
                Ok(n) => debug!("Deleted {n} dependent rows from {}", dependent.table),
                Err(StoreError::UndefinedTable(_)) => {
                    debug!("Dependent table {} does not exist remotely", dependent.table)
                }
                Err(e) => return Err(e),
            }
        }

        let sql = delete_sql(dialect, &op.table, &[remote_key.to_string()]);
        ctx.remote_call(ctx.remote.execute(&sql, std::slice::from_ref(&remote_id)))
            .await?;
        resolved = true;
    }

    Ok(resolved)
}

async fn delete(
    ctx: &Context,
    schema: &TableSchema,
    op: &SyncOperation,
    remote_columns: &BTreeSet<String>,
) -> Result<(), StoreError> {
    let key_columns = schema
        .primary_key
        .iter()
        .map(|k| {
            ctx.aliases.resolve(k, remote_columns).ok_or_else(|| {
                StoreError::Other(format!("key column {}.{k} missing remotely", op.table))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let values = delete_key(schema, op)?;
    let sql = delete_sql(ctx.remote.dialect(), &op.table, &key_columns);
    let deleted = ctx.remote_call(ctx.remote.execute(&sql, &values)).await?;
    if deleted == 0 {
        debug!("Remote {} {} was already gone", op.table, op.record_key);
    }
    Ok(())
}

/// Key values for a delete: from the payload when it carries them, else
/// from the record key.
fn delete_key(schema: &TableSchema, op: &SyncOperation) -> Result<Vec<SqlValue>, StoreError> {
    let from_payload: Option<Vec<SqlValue>> = schema
        .primary_key
        .iter()
        .map(|k| {
            op.payload
                .get(k)
                .filter(|v| !v.is_null())
                .map(SqlValue::from_json)
        })
        .collect();
    if let Some(values) = from_payload {
        return Ok(values);
    }

    let parts: Vec<&str> = if schema.primary_key.len() == 1 {
        vec![op.record_key.as_str()]
    } else {
        op.record_key
            .splitn(schema.primary_key.len(), KEY_SEPARATOR)
            .collect()
    };
    if parts.len() != schema.primary_key.len() || op.record_key.is_empty() {
        return Err(StoreError::Other(format!(
            "record key '{}' does not match the key of {}",
            op.record_key, op.table
        )));
    }

    Ok(parts
        .into_iter()
        .map(|part| match part.parse::<i64>() {
            Ok(n) if n.to_string() == part => SqlValue::Int(n),
            _ => SqlValue::Text(part.to_string()),
        })
        .collect())
}
