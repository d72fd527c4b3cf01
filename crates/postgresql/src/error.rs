//! Classification of tokio-postgres errors into [`StoreError`].

use sync_core::StoreError;
use tokio_postgres::error::SqlState;

pub fn classify(err: tokio_postgres::Error) -> StoreError {
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());

    if err.is_closed() {
        return StoreError::Connectivity(message);
    }

    let Some(code) = err.code() else {
        let text = err.to_string();
        if text.contains("serializing parameter") || text.contains("deserializing column") {
            return StoreError::Conversion(text);
        }
        if is_transport(&err) {
            return StoreError::Connectivity(text);
        }
        return StoreError::Other(text);
    };

    match code {
        c if *c == SqlState::UNIQUE_VIOLATION => StoreError::UniqueViolation {
            constraint: err
                .as_db_error()
                .and_then(|db| db.constraint())
                .map(str::to_string),
            message,
        },
        c if *c == SqlState::NUMERIC_VALUE_OUT_OF_RANGE => StoreError::SequenceOverflow(message),
        c if *c == SqlState::DATATYPE_MISMATCH || *c == SqlState::UNDEFINED_FUNCTION => {
            StoreError::NonNumericKey(message)
        }
        c if *c == SqlState::UNDEFINED_TABLE => StoreError::UndefinedTable(message),
        c if is_connectivity_class(c.code()) => StoreError::Connectivity(message),
        _ => StoreError::Other(format!("{message} (SQLSTATE {})", code.code())),
    }
}

/// Whether an error without SQLSTATE came from the socket rather than
/// from the client library rejecting a statement or a value.
fn is_transport(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = cause.source();
    }
    let text = err.to_string();
    text.starts_with("error connecting") || text.starts_with("timeout")
}

/// Class 08 (connection exception), 28 (invalid authorization) and 57P
/// (operator intervention, e.g. shutdown) all mean the store is unusable.
fn is_connectivity_class(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("28") || code.starts_with("57P")
}
