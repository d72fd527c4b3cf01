//! SQLite Local Store for ritel-sync.
//!
//! [`SqliteStore`] owns the application's local database and provides:
//!
//! - Schema introspection ([`schema`])
//! - The Operation Log and `sync_meta` flags ([`queue`])
//! - Trigger-based write capture ([`capture`])
//! - The per-table refresh transaction used by pull ([`refresh`])
//!
//! It also implements [`RemoteStore`], so a second SQLite database can stand
//! in for the central store.

pub mod capture;
pub mod error;
pub mod queue;
pub mod refresh;
pub mod schema;
pub mod value;

use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{
    select_sql, Dialect, RemoteStore, Row, SqliteDialect, StoreError, TableSchema,
};
use tracing::{debug, info};

pub use error::classify;
pub use refresh::RefreshOutcome;
pub use schema::ColumnInfo;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A single SQLite connection shared by the application and the engine.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    label: String,
}

impl SqliteStore {
    /// Open (creating if needed) a database file tuned for a long-running
    /// writer: WAL journaling with `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(classify)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(classify)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(classify)?;
        info!("Opened SQLite store {} (journal_mode={mode})", path.display());
        Self::from_connection(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    /// Wrap an already opened connection. Enables foreign keys and a busy
    /// timeout.
    pub fn from_connection(conn: Connection, label: String) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(classify)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            label,
        })
    }

    /// Database path, or `:memory:`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `f` with exclusive access to the connection on the blocking
    /// pool, so a long refresh never stalls the runtime's timers.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Other(format!("local store task failed: {e}")))?
        .map_err(classify)
    }

    /// User tables, `sync_queue` and `sync_meta` included.
    pub async fn tables(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| schema::list_tables(conn)).await
    }

    pub async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| schema::table_schema(conn, &table)).await
    }

    pub async fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| schema::column_info(conn, &table)).await
    }

    /// Every row of `table`, restricted to `columns`.
    pub async fn read_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, StoreError> {
        let sql = select_sql(&SqliteDialect, table, columns);
        self.query(&sql, &[]).await
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    fn dialect(&self) -> &dyn Dialect {
        &SqliteDialect
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }

    async fn columns_of(&self, table: &str) -> Result<Option<BTreeSet<String>>, StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| schema::column_set(conn, &table)).await
    }

    async fn execute(&self, sql: &str, params: &[sync_core::SqlValue]) -> Result<u64, StoreError> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            conn.execute(&sql, params_from_iter(value::params(&params)))
        })
        .await
        .map(|n| n as u64)
    }

    async fn query(&self, sql: &str, params: &[sync_core::SqlValue]) -> Result<Vec<Row>, StoreError> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let width = stmt.column_count();
            let rows = stmt
                .query_map(params_from_iter(value::params(&params)), |row| {
                    value::read_row(row, width)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// SQLite only keeps a counter for `AUTOINCREMENT` tables, in
    /// `sqlite_sequence`. Other integer keys already allocate `MAX(rowid)+1`.
    async fn reset_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError> {
        let columns = self.column_info(table).await?;
        let key = columns
            .iter()
            .find(|c| c.name == key_column)
            .ok_or_else(|| StoreError::UndefinedTable(format!("{table}.{key_column}")))?;
        if !key.is_integer() {
            return Err(StoreError::NonNumericKey(format!(
                "{table}.{key_column} is {}",
                key.declared_type
            )));
        }

        let sql = format!(
            "UPDATE sqlite_sequence SET seq = (SELECT COALESCE(MAX({key}), 0) FROM {table}) \
             WHERE name = ?1",
            key = SqliteDialect.quote_ident(key_column),
            table = SqliteDialect.quote_ident(table),
        );
        let table_name = table.to_string();
        let updated = self
            .with_conn(move |conn| {
                if !schema::table_exists(conn, "sqlite_sequence")? {
                    return Ok(0);
                }
                conn.execute(&sql, [&table_name])
            })
            .await?;
        debug!("Reset sqlite_sequence for {table} ({updated} rows)");
        Ok(())
    }

    async fn widen_sequence(&self, _table: &str, _key_column: &str) -> Result<(), StoreError> {
        // SQLite integers are always 64-bit.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::SqlValue;

    #[tokio::test]
    async fn test_remote_store_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE produk (id INTEGER PRIMARY KEY AUTOINCREMENT, nama TEXT)",
                &[],
            )
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO produk (id, nama) VALUES (?1, ?2)",
                &[SqlValue::Int(40), SqlValue::Text("Gula".into())],
            )
            .await
            .unwrap();

        let rows = store
            .read_rows("produk", &["id".to_string(), "nama".to_string()])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Int(40), SqlValue::Text("Gula".into())]]);
        assert_eq!(store.count_rows("produk").await.unwrap(), 1);

        let columns = store.columns_of("produk").await.unwrap().unwrap();
        assert!(columns.contains("nama"));
        assert!(store.columns_of("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_sequence_follows_max_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE produk (id INTEGER PRIMARY KEY AUTOINCREMENT, nama TEXT);
                     INSERT INTO produk (nama) VALUES ('a');
                     INSERT INTO produk (id, nama) VALUES (500, 'b');
                     UPDATE sqlite_sequence SET seq = 1 WHERE name = 'produk';",
                )
            })
            .await
            .unwrap();

        store.reset_sequence("produk", "id").await.unwrap();
        store
            .execute("INSERT INTO produk (nama) VALUES ('c')", &[])
            .await
            .unwrap();
        let rows = store
            .query("SELECT MAX(id) FROM produk", &[])
            .await
            .unwrap();
        assert_eq!(rows[0][0], SqlValue::Int(501));
    }

    #[tokio::test]
    async fn test_reset_sequence_text_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute("CREATE TABLE batch (id TEXT PRIMARY KEY)", &[])
            .await
            .unwrap();
        assert!(matches!(
            store.reset_sequence("batch", "id").await,
            Err(StoreError::NonNumericKey(_))
        ));
    }

    #[tokio::test]
    async fn test_long_statement_leaves_timers_running() {
        let store = SqliteStore::open_in_memory().unwrap();
        let slow = store.with_conn(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        // Single-threaded runtime: the deadline only fires if the closure
        // runs off the runtime thread.
        assert!(tokio::time::timeout(Duration::from_millis(50), slow)
            .await
            .is_err());

        // The connection is handed back once the closure finishes.
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ritel.db")).unwrap();
        let mode = store
            .with_conn(|conn| conn.pragma_query_value(None, "journal_mode", |r| r.get::<_, String>(0)))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
