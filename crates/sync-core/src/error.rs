//! Error taxonomy shared by the Local and Remote stores.

use thiserror::Error;

/// Errors returned by store operations, already classified from the
/// driver's native error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("store unreachable: {0}")]
    Connectivity(String),

    /// A unique or primary key constraint rejected the write
    #[error("unique constraint violation: {message}")]
    UniqueViolation {
        constraint: Option<String>,
        message: String,
    },

    /// A sequence or integer column cannot hold the value
    #[error("value out of range: {0}")]
    SequenceOverflow(String),

    /// The key column is not numeric, so it has no sequence
    #[error("key is not numeric: {0}")]
    NonNumericKey(String),

    #[error("table does not exist: {0}")]
    UndefinedTable(String),

    /// A value could not be converted to the column's type
    #[error("value conversion failed: {0}")]
    Conversion(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}
