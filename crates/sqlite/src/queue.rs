//! The Operation Log (`sync_queue`) and engine metadata (`sync_meta`).
//!
//! Every function here is a short, single-statement write or a read, so
//! queue bookkeeping never holds the connection for long.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use sync_core::{
    timestamp, OpStatus, Operation, Payload, QueueStats, StoreError, SyncOperation,
};
use tracing::warn;

use crate::SqliteStore;

pub const QUEUE_TABLE: &str = "sync_queue";
pub const META_TABLE: &str = "sync_meta";

/// Suppresses write capture while set to `'1'`.
pub const META_PAUSED: &str = "paused";
/// Set to `'1'` once the one-time full push has run.
pub const META_INITIAL_SYNC_COMPLETED: &str = "initial_sync_completed";

/// SQLite expression producing the queue's timestamp encoding.
pub(crate) const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        operation TEXT NOT NULL,
        record_id TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        synced_at TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        revision INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(table_name, record_id);

    INSERT OR IGNORE INTO sync_meta (key, value) VALUES ('paused', '0');
";

const SELECT_COLUMNS: &str = "id, table_name, operation, record_id, data, created_at, \
                              synced_at, retry_count, last_error, status, revision";

/// Render a timestamp in the queue's fixed-width encoding, so that text
/// comparison orders chronologically.
pub fn queue_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Append a pending operation.
///
/// With `coalesce`, an existing pending operation for the same record is
/// overwritten in place instead: it keeps its id and queue position and
/// takes the new operation and payload with a fresh retry budget.
pub fn enqueue(
    conn: &Connection,
    table: &str,
    operation: Operation,
    record_key: &str,
    payload: &Payload,
    coalesce: bool,
) -> rusqlite::Result<i64> {
    let data = serde_json::Value::Object(payload.clone()).to_string();

    if coalesce {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM sync_queue
                 WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending'
                 ORDER BY id DESC LIMIT 1",
                params![table, record_key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE sync_queue
                 SET operation = ?2, data = ?3, retry_count = 0, last_error = NULL,
                     revision = revision + 1
                 WHERE id = ?1",
                params![id, operation.as_str(), data],
            )?;
            return Ok(id);
        }
    }

    conn.execute(
        "INSERT INTO sync_queue (table_name, operation, record_id, data, status, retry_count)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0)",
        params![table, operation.as_str(), record_key, data],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Oldest pending operations first, at most `limit`.
///
/// Rows whose operation is not recognized can never be replayed, so they
/// are failed here rather than handed to the push path.
pub fn pending(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<SyncOperation>> {
    let rejected = conn.execute(
        "UPDATE sync_queue
         SET status = 'failed', last_error = 'unknown operation: ' || operation
         WHERE status = 'pending' AND UPPER(operation) NOT IN ('INSERT', 'UPDATE', 'DELETE')",
        [],
    )?;
    if rejected > 0 {
        warn!("Failed {rejected} queued operations with an unknown operation type");
    }

    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_queue
         WHERE status = 'pending'
         ORDER BY created_at ASC, id ASC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map([limit as i64], read_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Mark `op` synced. Returns false, leaving the row pending, when a newer
/// write was coalesced into it after it was dequeued.
pub fn mark_synced(conn: &Connection, op: &SyncOperation) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        &format!(
            "UPDATE sync_queue SET status = 'synced', synced_at = {NOW_SQL}, last_error = NULL
             WHERE id = ?1 AND revision = ?2"
        ),
        params![op.id, op.revision],
    )?;
    Ok(updated > 0)
}

/// Record a failed attempt. Returns the resulting status: `Pending` while
/// retries remain, `Failed` once `max_retries` attempts have been spent.
///
/// A row that was coalesced since it was dequeued is left untouched.
pub fn mark_failed(
    conn: &Connection,
    op: &SyncOperation,
    error: &str,
    max_retries: u32,
) -> rusqlite::Result<OpStatus> {
    let status: Option<String> = conn
        .query_row(
            "UPDATE sync_queue
             SET retry_count = retry_count + 1,
                 last_error = ?3,
                 status = CASE WHEN retry_count + 1 >= ?4 THEN 'failed' ELSE 'pending' END
             WHERE id = ?1 AND revision = ?2
             RETURNING status",
            params![op.id, op.revision, error, max_retries],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match status.as_deref() {
        Some("failed") => OpStatus::Failed,
        _ => OpStatus::Pending,
    })
}

pub fn stats(conn: &Connection) -> rusqlite::Result<QueueStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let mut rows = stmt.query([])?;
    let mut stats = QueueStats::default();
    while let Some(row) = rows.next()? {
        let status: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        match status.parse::<OpStatus>() {
            Ok(OpStatus::Pending) => stats.pending = count as u64,
            Ok(OpStatus::Synced) => stats.synced = count as u64,
            Ok(OpStatus::Failed) => stats.failed = count as u64,
            Err(e) => warn!("Ignoring {count} queue rows: {e}"),
        }
    }
    Ok(stats)
}

/// Move every failed operation back to pending with a fresh retry budget.
pub fn reset_failed(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', retry_count = 0 WHERE status = 'failed'",
        [],
    )
}

/// Most recently queued failed operations first.
pub fn failed(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<SyncOperation>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_queue
         WHERE status = 'failed'
         ORDER BY id DESC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map([limit as i64], read_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Distinct table names present in the log, in any status.
pub fn queued_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT table_name FROM sync_queue ORDER BY table_name")?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

/// Delete every log row for `table`, whatever its status.
pub fn purge_table(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM sync_queue WHERE table_name = ?1", [table])
}

/// Delete synced rows whose `synced_at` is older than `before`.
pub fn vacuum_synced(conn: &Connection, before: &DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM sync_queue WHERE status = 'synced' AND synced_at < ?1",
        [queue_time(before)],
    )
}

/// Record keys of `table` that still have a pending or failed operation.
pub fn unresolved_keys(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT record_id FROM sync_queue
         WHERE table_name = ?1 AND status IN ('pending', 'failed')",
    )?;
    let keys = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(keys)
}

pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn read_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncOperation> {
    let operation: String = row.get(2)?;
    let operation = operation
        .parse::<Operation>()
        .map_err(|e| conversion_error(2, e.into()))?;

    let table: String = row.get(1)?;
    let id: i64 = row.get(0)?;
    let data: String = row.get(4)?;
    let payload = match serde_json::from_str::<Payload>(&data) {
        Ok(payload) => payload,
        Err(e) => {
            // An empty payload fails the push and ends up in last_error.
            warn!("Operation {id} on {table} has an unreadable payload: {e}");
            Payload::new()
        }
    };

    let status: String = row.get(9)?;
    let status = status
        .parse::<OpStatus>()
        .map_err(|e| conversion_error(9, e.into()))?;

    Ok(SyncOperation {
        id,
        table,
        operation,
        record_key: row.get(3)?,
        payload,
        created_at: read_time(row, 5)?.unwrap_or_else(Utc::now),
        synced_at: read_time(row, 6)?,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        status,
        revision: row.get(10)?,
    })
}

fn read_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|s| timestamp::parse(&s, chrono_tz::Tz::UTC))
        .transpose()
        .map_err(|e| conversion_error(idx, Box::new(e)))
}

fn conversion_error(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

impl SqliteStore {
    /// Create `sync_queue` / `sync_meta` if missing.
    pub async fn ensure_queue_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| ensure_schema(conn)).await
    }

    pub async fn enqueue(
        &self,
        table: &str,
        operation: Operation,
        record_key: &str,
        payload: &Payload,
        coalesce: bool,
    ) -> Result<i64, StoreError> {
        let table = table.to_string();
        let record_key = record_key.to_string();
        let payload = payload.clone();
        self.with_conn(move |conn| {
            enqueue(conn, &table, operation, &record_key, &payload, coalesce)
        })
        .await
    }

    pub async fn pending_operations(&self, limit: usize) -> Result<Vec<SyncOperation>, StoreError> {
        self.with_conn(move |conn| pending(conn, limit)).await
    }

    pub async fn mark_synced(&self, op: &SyncOperation) -> Result<bool, StoreError> {
        let op = op.clone();
        self.with_conn(move |conn| mark_synced(conn, &op)).await
    }

    pub async fn mark_failed(
        &self,
        op: &SyncOperation,
        error: &str,
        max_retries: u32,
    ) -> Result<OpStatus, StoreError> {
        let (op, error) = (op.clone(), error.to_string());
        self.with_conn(move |conn| mark_failed(conn, &op, &error, max_retries))
            .await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.with_conn(|conn| stats(conn)).await
    }

    pub async fn reset_failed(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| reset_failed(conn)).await
    }

    pub async fn failed_operations(&self, limit: usize) -> Result<Vec<SyncOperation>, StoreError> {
        self.with_conn(move |conn| failed(conn, limit)).await
    }

    pub async fn queued_tables(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| queued_tables(conn)).await
    }

    pub async fn purge_queue_table(&self, table: &str) -> Result<usize, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| purge_table(conn, &table)).await
    }

    pub async fn vacuum_synced(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| vacuum_synced(conn, &before)).await
    }

    pub async fn unresolved_keys(&self, table: &str) -> Result<HashSet<String>, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| unresolved_keys(conn, &table)).await
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| get_meta(conn, &key)).await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| set_meta(conn, &key, &value)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_is_idempotent_and_unpaused() {
        let conn = conn();
        ensure_schema(&conn).unwrap();
        assert_eq!(get_meta(&conn, META_PAUSED).unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn test_pending_is_fifo_and_bounded() {
        let conn = conn();
        for i in 1..=3 {
            enqueue(
                &conn,
                "produk",
                Operation::Insert,
                &i.to_string(),
                &payload(json!({"id": i})),
                false,
            )
            .unwrap();
        }

        let ops = pending(&conn, 2).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].record_key, "1");
        assert_eq!(ops[1].record_key, "2");
        assert_eq!(ops[0].payload.get("id"), Some(&json!(1)));
        assert_eq!(ops[0].status, OpStatus::Pending);
    }

    #[test]
    fn test_coalesce_keeps_position() {
        let conn = conn();
        let a = payload(json!({"id": 1, "nama": "a"}));
        let b = payload(json!({"id": 1, "nama": "b"}));
        let first = enqueue(&conn, "produk", Operation::Insert, "1", &a, true).unwrap();
        enqueue(&conn, "produk", Operation::Insert, "2", &Payload::new(), true).unwrap();
        let again = enqueue(&conn, "produk", Operation::Update, "1", &b, true).unwrap();

        assert_eq!(first, again);
        let ops = pending(&conn, 10).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].id, first);
        assert_eq!(ops[0].operation, Operation::Update);
        assert_eq!(ops[0].payload.get("nama"), Some(&json!("b")));
    }

    #[test]
    fn test_coalesced_write_survives_inflight_push() {
        let conn = conn();
        let a = payload(json!({"id": 1, "nama": "a"}));
        let b = payload(json!({"id": 1, "nama": "b"}));
        enqueue(&conn, "produk", Operation::Insert, "1", &a, true).unwrap();

        let inflight = pending(&conn, 1).unwrap().remove(0);
        enqueue(&conn, "produk", Operation::Update, "1", &b, true).unwrap();

        assert!(!mark_synced(&conn, &inflight).unwrap());
        let ops = pending(&conn, 10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].revision, 1);
        assert_eq!(ops[0].payload.get("nama"), Some(&json!("b")));
    }

    #[test]
    fn test_no_coalesce_appends() {
        let conn = conn();
        enqueue(&conn, "produk", Operation::Insert, "1", &Payload::new(), false).unwrap();
        enqueue(&conn, "produk", Operation::Update, "1", &Payload::new(), false).unwrap();
        assert_eq!(pending(&conn, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_retry_budget() {
        let conn = conn();
        enqueue(&conn, "produk", Operation::Insert, "1", &Payload::new(), false).unwrap();
        let op = pending(&conn, 1).unwrap().remove(0);

        for _ in 0..4 {
            assert_eq!(mark_failed(&conn, &op, "boom", 5).unwrap(), OpStatus::Pending);
        }
        assert_eq!(mark_failed(&conn, &op, "boom", 5).unwrap(), OpStatus::Failed);

        let failed_ops = failed(&conn, 10).unwrap();
        assert_eq!(failed_ops.len(), 1);
        assert_eq!(failed_ops[0].retry_count, 5);
        assert_eq!(failed_ops[0].last_error.as_deref(), Some("boom"));

        assert_eq!(reset_failed(&conn).unwrap(), 1);
        let ops = pending(&conn, 10).unwrap();
        assert_eq!(ops[0].retry_count, 0);
    }

    #[test]
    fn test_stats_and_vacuum() {
        let conn = conn();
        enqueue(&conn, "produk", Operation::Insert, "1", &Payload::new(), false).unwrap();
        enqueue(&conn, "produk", Operation::Insert, "2", &Payload::new(), false).unwrap();
        let first = pending(&conn, 1).unwrap().remove(0);
        assert!(mark_synced(&conn, &first).unwrap());

        assert_eq!(
            stats(&conn).unwrap(),
            QueueStats {
                pending: 1,
                synced: 1,
                failed: 0
            }
        );

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(vacuum_synced(&conn, &cutoff).unwrap(), 1);
        assert_eq!(stats(&conn).unwrap().synced, 0);
    }

    #[test]
    fn test_unknown_operation_is_failed() {
        let conn = conn();
        conn.execute(
            "INSERT INTO sync_queue (table_name, operation, record_id, data)
             VALUES ('produk', 'MERGE', '1', '{}')",
            [],
        )
        .unwrap();
        assert!(pending(&conn, 10).unwrap().is_empty());
        assert_eq!(stats(&conn).unwrap().failed, 1);
    }

    #[test]
    fn test_unresolved_keys_and_purge() {
        let conn = conn();
        enqueue(&conn, "produk", Operation::Insert, "1", &Payload::new(), false).unwrap();
        let synced = pending(&conn, 1).unwrap().remove(0);
        mark_synced(&conn, &synced).unwrap();
        enqueue(&conn, "produk", Operation::Insert, "2", &Payload::new(), false).unwrap();
        enqueue(&conn, "backup_produk", Operation::Insert, "9", &Payload::new(), false).unwrap();

        let keys = unresolved_keys(&conn, "produk").unwrap();
        assert!(keys.contains("2"));
        assert!(!keys.contains("1"));

        assert_eq!(queued_tables(&conn).unwrap(), vec!["backup_produk", "produk"]);
        assert_eq!(purge_table(&conn, "backup_produk").unwrap(), 1);
    }

    #[test]
    fn test_meta_upsert() {
        let conn = conn();
        assert_eq!(get_meta(&conn, META_INITIAL_SYNC_COMPLETED).unwrap(), None);
        set_meta(&conn, META_INITIAL_SYNC_COMPLETED, "1").unwrap();
        set_meta(&conn, META_INITIAL_SYNC_COMPLETED, "0").unwrap();
        assert_eq!(
            get_meta(&conn, META_INITIAL_SYNC_COMPLETED).unwrap().as_deref(),
            Some("0")
        );
    }
}
