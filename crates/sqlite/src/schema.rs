//! Local schema introspection via `sqlite_master` and `PRAGMA table_info`.

use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use sync_core::TableSchema;

/// One column as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    /// 1-based position within the primary key, 0 if not part of it
    pub pk_position: u32,
}

impl ColumnInfo {
    /// SQLite type affinity rule 1: the declared type contains "INT".
    pub fn is_integer(&self) -> bool {
        self.declared_type.to_ascii_uppercase().contains("INT")
    }
}

/// User tables, excluding SQLite's internal `sqlite_*` tables.
pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

pub fn column_info(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                declared_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                pk_position: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Column names of `table`, or `None` if it does not exist.
pub fn column_set(conn: &Connection, table: &str) -> rusqlite::Result<Option<BTreeSet<String>>> {
    let columns = column_info(conn, table)?;
    if columns.is_empty() {
        return Ok(None);
    }
    Ok(Some(columns.into_iter().map(|c| c.name).collect()))
}

/// Columns and primary key of `table`, or `None` if it does not exist.
///
/// Tables without a declared primary key report an empty key.
pub fn table_schema(conn: &Connection, table: &str) -> rusqlite::Result<Option<TableSchema>> {
    let columns = column_info(conn, table)?;
    if columns.is_empty() {
        return Ok(None);
    }

    let mut key: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk_position > 0).collect();
    key.sort_by_key(|c| c.pk_position);
    let primary_key = key.iter().map(|c| c.name.clone()).collect();

    Ok(Some(TableSchema::new(
        table,
        columns.iter().map(|c| c.name.clone()).collect(),
        primary_key,
    )))
}
