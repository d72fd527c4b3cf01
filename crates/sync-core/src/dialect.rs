//! Dialect adapter.
//!
//! Placeholder rendering, identifier quoting, keyed upsert/delete statement
//! construction, and Local to Remote column name translation. Everything
//! here is pure; live column introspection lives on the stores.

use std::collections::BTreeSet;

/// Per-backend SQL syntax.
pub trait Dialect: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Render the positional placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Quote an identifier, doubling embedded quotes.
    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// PostgreSQL: `$1, $2, ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }
}

/// SQLite: `?1, ?2, ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }
}

fn quoted_list(dialect: &dyn Dialect, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(dialect: &dyn Dialect, start: usize, count: usize) -> Vec<String> {
    (start..start + count)
        .map(|i| dialect.placeholder(i))
        .collect()
}

/// `INSERT ... ON CONFLICT (<key>) DO UPDATE SET <non-key> = excluded.<non-key>`
///
/// Falls back to `DO NOTHING` when every column is part of the key.
/// Parameters bind in `columns` order.
pub fn upsert_sql(
    dialect: &dyn Dialect,
    table: &str,
    columns: &[String],
    key_columns: &[String],
) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(c))
        .map(|c| {
            let q = dialect.quote_ident(c);
            format!("{q} = excluded.{q}")
        })
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        dialect.quote_ident(table),
        quoted_list(dialect, columns),
        placeholders(dialect, 1, columns.len()).join(", "),
        quoted_list(dialect, key_columns),
        action
    )
}

/// `DELETE FROM <table> WHERE k1 = ? AND k2 = ?`
pub fn delete_sql(dialect: &dyn Dialect, table: &str, key_columns: &[String]) -> String {
    let predicate = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote_ident(c), dialect.placeholder(i + 1)))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!("DELETE FROM {} WHERE {}", dialect.quote_ident(table), predicate)
}

/// `SELECT <columns> FROM <table>`
pub fn select_sql(dialect: &dyn Dialect, table: &str, columns: &[String]) -> String {
    format!(
        "SELECT {} FROM {}",
        quoted_list(dialect, columns),
        dialect.quote_ident(table)
    )
}

/// Known column spellings that drifted between the two schemas.
///
/// Pairs are symmetric: either side may be the local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAliases {
    pairs: Vec<(String, String)>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        Self::new(vec![("berat_gram".to_string(), "beratgram".to_string())])
    }
}

impl ColumnAliases {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// Resolve a column name against the set of columns the other side has.
    pub fn resolve(&self, column: &str, available: &BTreeSet<String>) -> Option<String> {
        if available.contains(column) {
            return Some(column.to_string());
        }

        self.pairs.iter().find_map(|(a, b)| {
            let other = if a == column {
                b
            } else if b == column {
                a
            } else {
                return None;
            };
            available.contains(other).then(|| other.clone())
        })
    }
}

/// Local to Remote column mapping for one table, derived from a live
/// column set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
    dropped: Vec<String>,
}

impl ColumnMapping {
    /// Map every local column that has a remote counterpart. Columns with
    /// none are recorded in [`ColumnMapping::dropped`].
    pub fn build<'a>(
        local_columns: impl IntoIterator<Item = &'a str>,
        remote_columns: &BTreeSet<String>,
        aliases: &ColumnAliases,
    ) -> Self {
        let mut mapping = Self::default();
        for local in local_columns {
            match aliases.resolve(local, remote_columns) {
                Some(remote) => mapping.pairs.push((local.to_string(), remote)),
                None => mapping.dropped.push(local.to_string()),
            }
        }
        mapping
    }

    pub fn remote_for(&self, local: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(l, _)| l == local)
            .map(|(_, r)| r.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn local_columns(&self) -> Vec<String> {
        self.pairs.iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn remote_columns(&self) -> Vec<String> {
        self.pairs.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
