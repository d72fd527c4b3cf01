//! Typed per-table schema registry.
//!
//! Queued payloads are an opaque JSON map, so their shape is validated here
//! at enqueue time instead of surfacing as a failed push much later.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::Operation;
use crate::values::Payload;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("payload for {table} is empty")]
    Empty { table: String },

    #[error("payload for {table} has unknown column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("payload for {table} is missing key column '{column}'")]
    MissingKey { table: String, column: String },
}

/// Columns and primary key of one local table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>, primary_key: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// The sole key column, if the key is not composite.
    pub fn single_key(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    /// Check a payload against this table.
    ///
    /// Inserts and updates must carry every key column. Every payload key
    /// must be a known column. Deletes may carry an empty payload since the
    /// record key identifies the row.
    pub fn validate(&self, operation: Operation, payload: &Payload) -> Result<(), PayloadError> {
        if operation.is_upsert() && payload.is_empty() {
            return Err(PayloadError::Empty {
                table: self.name.clone(),
            });
        }

        if let Some(column) = payload.keys().find(|k| !self.has_column(k)) {
            return Err(PayloadError::UnknownColumn {
                table: self.name.clone(),
                column: column.clone(),
            });
        }

        if operation.is_upsert() {
            if let Some(column) = self
                .primary_key
                .iter()
                .find(|k| payload.get(k.as_str()).map_or(true, |v| v.is_null()))
            {
                return Err(PayloadError::MissingKey {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Registry of known local tables.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: TableSchema) {
        self.tables.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn produk() -> TableSchema {
        TableSchema::new(
            "produk",
            vec!["id".into(), "nama".into(), "harga".into()],
            vec!["id".into()],
        )
    }

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_insert() {
        let p = payload(json!({"id": 1, "nama": "Gula", "harga": 15000}));
        assert!(produk().validate(Operation::Insert, &p).is_ok());
    }

    #[test]
    fn test_unknown_column_rejected() {
        let p = payload(json!({"id": 1, "warna": "merah"}));
        assert_eq!(
            produk().validate(Operation::Update, &p),
            Err(PayloadError::UnknownColumn {
                table: "produk".into(),
                column: "warna".into()
            })
        );
    }

    #[test]
    fn test_missing_or_null_key_rejected() {
        let p = payload(json!({"nama": "Gula"}));
        assert!(matches!(
            produk().validate(Operation::Insert, &p),
            Err(PayloadError::MissingKey { .. })
        ));

        let p = payload(json!({"id": null, "nama": "Gula"}));
        assert!(matches!(
            produk().validate(Operation::Insert, &p),
            Err(PayloadError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_delete_allows_empty_payload() {
        assert!(produk()
            .validate(Operation::Delete, &Payload::new())
            .is_ok());
    }

    #[test]
    fn test_single_key() {
        assert_eq!(produk().single_key(), Some("id"));
        let composite = TableSchema::new("x", vec![], vec!["a".into(), "b".into()]);
        assert_eq!(composite.single_key(), None);
    }
}
