//! Trigger-based write capture.
//!
//! Each captured table gets AFTER INSERT / UPDATE / DELETE triggers that
//! append the row, as a JSON object, to `sync_queue`. The triggers are
//! gated on `sync_meta.paused`, so rows written by a refresh from the
//! Remote Store are not captured again.

use rusqlite::Connection;
use sync_core::{StoreError, TableSchema};
use tracing::{info, warn};

use crate::queue::NOW_SQL;
use crate::SqliteStore;

const TRIGGER_PREFIX: &str = "ritel_sync";

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `json_object('a', NEW."a", 'b', NEW."b")`. `json_object` rejects BLOB
/// arguments, so blobs go in as `\x`-prefixed hex text.
fn json_object(row: &str, columns: &[String]) -> String {
    let pairs = columns
        .iter()
        .map(|c| {
            let value = format!("{row}.{}", quote(c));
            format!(
                "{}, CASE WHEN typeof({value}) = 'blob' THEN '\\x' || hex({value}) ELSE {value} END",
                literal(c)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("json_object({pairs})")
}

/// `NEW."a" || ':' || NEW."b"`, matching `sync_core::record_key`
fn record_key(row: &str, key: &[String]) -> String {
    key.iter()
        .map(|c| format!("{row}.{}", quote(c)))
        .collect::<Vec<_>>()
        .join(" || ':' || ")
}

pub fn trigger_name(table: &str, operation: &str) -> String {
    format!("{TRIGGER_PREFIX}_{}_{table}", operation.to_ascii_lowercase())
}

/// `OLD."a" IS NOT NEW."a" OR ...`
fn key_changed(key: &[String]) -> String {
    key.iter()
        .map(|c| format!("OLD.{q} IS NOT NEW.{q}", q = quote(c)))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Build the three trigger statements for a table.
///
/// An UPDATE that moves the primary key first queues a DELETE of the old
/// key, so the Remote Store does not keep the row under both keys.
pub fn trigger_sql(schema: &TableSchema) -> Vec<(&'static str, String)> {
    let table = &schema.name;
    let gate = "(SELECT value FROM sync_meta WHERE key = 'paused') = '0'";
    let enqueue = |operation: &str, row: &str| {
        format!(
            "INSERT INTO sync_queue (table_name, operation, record_id, data, created_at)
             SELECT {table_lit}, '{operation}', {key}, {data}, {NOW_SQL}",
            table_lit = literal(table),
            key = record_key(row, &schema.primary_key),
            data = json_object(row, &schema.columns),
        )
    };

    let statement = |operation: &'static str, body: String| {
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER {operation} ON {table_q}
             FOR EACH ROW WHEN {gate}
             BEGIN
                 {body};
             END",
            name = quote(&trigger_name(table, operation)),
            table_q = quote(table),
        )
    };

    let update = format!(
        "{} WHERE {};
                 {}",
        enqueue("DELETE", "OLD"),
        key_changed(&schema.primary_key),
        enqueue("UPDATE", "NEW"),
    );

    vec![
        ("INSERT", statement("INSERT", enqueue("INSERT", "NEW"))),
        ("UPDATE", statement("UPDATE", update)),
        ("DELETE", statement("DELETE", enqueue("DELETE", "OLD"))),
    ]
}

/// Install capture triggers on `schema`'s table. Existing triggers are kept.
pub fn install(conn: &Connection, schema: &TableSchema) -> rusqlite::Result<()> {
    for (operation, sql) in trigger_sql(schema) {
        conn.execute_batch(&sql)?;
        info!("Installed {operation} capture trigger for table: {}", schema.name);
    }
    Ok(())
}

pub fn uninstall(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    for operation in ["INSERT", "UPDATE", "DELETE"] {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {}",
            quote(&trigger_name(table, operation))
        ))?;
    }
    Ok(())
}

impl SqliteStore {
    /// Install capture triggers on every table in `schemas` that has a
    /// primary key. Returns the number of tables instrumented.
    pub async fn install_capture(&self, schemas: &[TableSchema]) -> Result<usize, StoreError> {
        let schemas = schemas.to_vec();
        self.with_conn(move |conn| {
            let mut installed = 0;
            for schema in &schemas {
                if schema.primary_key.is_empty() {
                    warn!("Not capturing writes to {}: no primary key", schema.name);
                    continue;
                }
                install(conn, schema)?;
                installed += 1;
            }
            Ok(installed)
        })
        .await
    }

    pub async fn uninstall_capture(&self, table: &str) -> Result<(), StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| uninstall(conn, &table)).await
    }
}
