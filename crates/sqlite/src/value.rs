//! Conversion between [`SqlValue`] and SQLite storage classes.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use sync_core::{timestamp, SqlValue};

/// Binds a [`SqlValue`] as a statement parameter.
///
/// SQLite has no boolean, decimal or timestamp storage class, so those are
/// stored as integer, text and canonical UTC text respectively.
#[derive(Debug)]
pub struct Param<'a>(pub &'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Decimal(d) => ToSqlOutput::Owned(Value::Text(d.to_string())),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Timestamp(dt) => ToSqlOutput::Owned(Value::Text(timestamp::canonical(dt))),
        })
    }
}

/// Wrap a parameter slice for `rusqlite::params_from_iter`.
pub fn params(values: &[SqlValue]) -> impl Iterator<Item = Param<'_>> {
    values.iter().map(Param)
}

/// Read one column of a result row.
pub fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    }
}

/// Read every column of a result row in select-list order.
pub fn read_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Vec<SqlValue>> {
    (0..width)
        .map(|i| row.get_ref(i).map(from_value_ref))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    fn roundtrip(value: SqlValue) -> SqlValue {
        let conn = Connection::open_in_memory().unwrap();
        conn.query_row("SELECT ?1", [Param(&value)], |row| {
            Ok(from_value_ref(row.get_ref(0)?))
        })
        .unwrap()
    }

    #[test]
    fn test_native_storage_classes() {
        assert_eq!(roundtrip(SqlValue::Int(-42)), SqlValue::Int(-42));
        assert_eq!(roundtrip(SqlValue::Float(1.5)), SqlValue::Float(1.5));
        assert_eq!(roundtrip(SqlValue::Null), SqlValue::Null);
        assert_eq!(
            roundtrip(SqlValue::Bytes(vec![0, 1, 2])),
            SqlValue::Bytes(vec![0, 1, 2])
        );
    }

    #[test]
    fn test_emulated_types() {
        assert_eq!(roundtrip(SqlValue::Bool(true)), SqlValue::Int(1));

        let dt = Utc.with_ymd_and_hms(2026, 1, 16, 0, 38, 3).unwrap();
        assert_eq!(
            roundtrip(SqlValue::Timestamp(dt)),
            SqlValue::Text("2026-01-16T00:38:03Z".into())
        );
    }
}
