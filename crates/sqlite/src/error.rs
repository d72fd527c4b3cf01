//! Classification of rusqlite errors into [`StoreError`].

use rusqlite::ffi;
use rusqlite::ErrorCode;
use sync_core::StoreError;

pub fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| err.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation
                    if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    StoreError::UniqueViolation {
                        constraint: constraint_name(&message),
                        message,
                    }
                }
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure => StoreError::Connectivity(message),
                _ if message.starts_with("no such table") => StoreError::UndefinedTable(message),
                _ => StoreError::Other(message),
            }
        }
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::ToSqlConversionFailure(_) => StoreError::Conversion(err.to_string()),
        _ => StoreError::Other(err.to_string()),
    }
}

/// `UNIQUE constraint failed: transaksi.nomor_transaksi` -> `transaksi.nomor_transaksi`
fn constraint_name(message: &str) -> Option<String> {
    message
        .split_once("constraint failed: ")
        .map(|(_, rest)| rest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_unique_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, code TEXT UNIQUE);
             INSERT INTO t VALUES (1, 'A');",
        )
        .unwrap();

        let err = conn
            .execute("INSERT INTO t VALUES (2, 'A')", [])
            .unwrap_err();
        assert_eq!(
            classify(err),
            StoreError::UniqueViolation {
                constraint: Some("t.code".into()),
                message: "UNIQUE constraint failed: t.code".into()
            }
        );

        let err = conn
            .execute("INSERT INTO t VALUES (1, 'B')", [])
            .unwrap_err();
        assert!(classify(err).is_unique_violation());
    }

    #[test]
    fn test_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.execute("DELETE FROM nope", []).unwrap_err();
        assert!(matches!(classify(err), StoreError::UndefinedTable(_)));
    }

    #[test]
    fn test_not_null_is_not_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (1, NULL)", [])
            .unwrap_err();
        assert!(matches!(classify(err), StoreError::Other(_)));
    }
}
