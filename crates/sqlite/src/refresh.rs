//! Per-table refresh from the Remote Store.
//!
//! One transaction per table. Foreign keys are suspended for its duration
//! since parents and children arrive in arbitrary order, and write capture
//! is paused inside it so pulled rows never re-enter the Operation Log.

use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::collections::HashSet;
use sync_core::{record_key, upsert_sql, Row, SqlValue, SqliteDialect, StoreError};
use tracing::debug;

use crate::queue::{self, META_PAUSED};
use crate::value;
use crate::SqliteStore;

/// What a table refresh did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Rows inserted or updated locally
    pub applied: usize,
    /// Rows rejected by a local constraint
    pub conflicts: usize,
    /// Rows left alone because the local copy has unpushed changes
    pub preserved: usize,
}

/// Upsert `rows` into `table`.
///
/// `columns` names the local columns in row order; `key_columns` must be a
/// subset. Rows whose record key is in `preserve` are skipped. A row that
/// violates a local constraint is skipped without affecting the others.
/// Any other error rolls the whole table back.
pub fn refresh_table(
    conn: &mut Connection,
    table: &str,
    columns: &[String],
    key_columns: &[String],
    rows: &[Row],
    preserve: &HashSet<String>,
) -> rusqlite::Result<RefreshOutcome> {
    let enforced: bool = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", false)?;
    let result = apply(conn, table, columns, key_columns, rows, preserve);
    conn.pragma_update(None, "foreign_keys", enforced)?;
    result
}

fn apply(
    conn: &mut Connection,
    table: &str,
    columns: &[String],
    key_columns: &[String],
    rows: &[Row],
    preserve: &HashSet<String>,
) -> rusqlite::Result<RefreshOutcome> {
    let key_positions: Vec<usize> = key_columns
        .iter()
        .filter_map(|k| columns.iter().position(|c| c == k))
        .collect();

    let tx = conn.transaction()?;
    queue::set_meta(&tx, META_PAUSED, "1")?;

    let mut outcome = RefreshOutcome::default();
    {
        let mut stmt = tx.prepare(&upsert_sql(&SqliteDialect, table, columns, key_columns))?;
        for row in rows {
            let key: Vec<SqlValue> = key_positions
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(SqlValue::Null))
                .collect();
            let key = record_key(&key);
            if preserve.contains(&key) {
                outcome.preserved += 1;
                continue;
            }

            match stmt.execute(params_from_iter(value::params(row))) {
                Ok(_) => outcome.applied += 1,
                Err(rusqlite::Error::SqliteFailure(failure, message))
                    if failure.code == ErrorCode::ConstraintViolation =>
                {
                    debug!(
                        "Skipping pulled row {table}/{key}: {}",
                        message.unwrap_or_default()
                    );
                    outcome.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    queue::set_meta(&tx, META_PAUSED, "0")?;
    tx.commit()?;
    Ok(outcome)
}

impl SqliteStore {
    /// Takes the rows by value: the refresh runs on the blocking pool.
    pub async fn refresh_table(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        rows: Vec<Row>,
        preserve: HashSet<String>,
    ) -> Result<RefreshOutcome, StoreError> {
        let table = table.to_string();
        let columns = columns.to_vec();
        let key_columns = key_columns.to_vec();
        self.with_conn(move |conn| {
            refresh_table(conn, &table, &columns, &key_columns, &rows, &preserve)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        queue::ensure_schema(&conn).unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE transaksi (id INTEGER PRIMARY KEY, nomor TEXT UNIQUE);
             CREATE TABLE transaksi_item (
                 id INTEGER PRIMARY KEY,
                 transaksi_id INTEGER REFERENCES transaksi(id),
                 qty INTEGER
             );
             INSERT INTO transaksi VALUES (1, 'TRX-001');",
        )
        .unwrap();
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_conflicting_row_does_not_block_others() {
        let mut conn = setup();
        let rows = vec![
            vec![SqlValue::Int(2), SqlValue::Text("TRX-001".into())],
            vec![SqlValue::Int(3), SqlValue::Text("TRX-003".into())],
            vec![SqlValue::Int(1), SqlValue::Text("TRX-001".into())],
        ];
        let outcome = refresh_table(
            &mut conn,
            "transaksi",
            &cols(&["id", "nomor"]),
            &cols(&["id"]),
            &rows,
            &HashSet::new(),
        )
        .unwrap();

        assert_eq!(
            outcome,
            RefreshOutcome {
                applied: 2,
                conflicts: 1,
                preserved: 0
            }
        );
        assert_eq!(count(&conn, "transaksi"), 2);
    }

    #[test]
    fn test_children_before_parents() {
        let mut conn = setup();
        let rows = vec![vec![SqlValue::Int(10), SqlValue::Int(99), SqlValue::Int(1)]];
        let outcome = refresh_table(
            &mut conn,
            "transaksi_item",
            &cols(&["id", "transaksi_id", "qty"]),
            &cols(&["id"]),
            &rows,
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(outcome.applied, 1);

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_pulled_rows_are_not_captured() {
        let mut conn = setup();
        let schema = crate::schema::table_schema(&conn, "transaksi")
            .unwrap()
            .unwrap();
        capture::install(&conn, &schema).unwrap();

        let rows = vec![vec![SqlValue::Int(5), SqlValue::Text("TRX-005".into())]];
        refresh_table(
            &mut conn,
            "transaksi",
            &cols(&["id", "nomor"]),
            &cols(&["id"]),
            &rows,
            &HashSet::new(),
        )
        .unwrap();

        assert!(queue::pending(&conn, 10).unwrap().is_empty());
        assert_eq!(
            queue::get_meta(&conn, META_PAUSED).unwrap().as_deref(),
            Some("0")
        );
    }

    #[test]
    fn test_preserved_keys_keep_local_state() {
        let mut conn = setup();
        let rows = vec![vec![SqlValue::Int(1), SqlValue::Text("TRX-REMOTE".into())]];
        let preserve: HashSet<String> = ["1".to_string()].into_iter().collect();
        let outcome = refresh_table(
            &mut conn,
            "transaksi",
            &cols(&["id", "nomor"]),
            &cols(&["id"]),
            &rows,
            &preserve,
        )
        .unwrap();

        assert_eq!(outcome.preserved, 1);
        let nomor: String = conn
            .query_row("SELECT nomor FROM transaksi WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nomor, "TRX-001");
    }

    #[test]
    fn test_hard_error_rolls_back_table() {
        let mut conn = setup();
        let rows = vec![vec![SqlValue::Int(7), SqlValue::Text("TRX-007".into())]];
        let err = refresh_table(
            &mut conn,
            "transaksi",
            &cols(&["id", "missing_column"]),
            &cols(&["id"]),
            &rows,
            &HashSet::new(),
        );
        assert!(err.is_err());
        assert_eq!(
            queue::get_meta(&conn, META_PAUSED).unwrap().as_deref(),
            Some("0")
        );
    }
}
