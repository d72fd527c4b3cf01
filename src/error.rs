//! Engine-level errors.

use sync_core::{PayloadError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Only the manual entry points surface this; background loops just wait.
    #[error("remote store not connected")]
    RemoteNotConnected,

    #[error("table {0} is excluded from sync")]
    ExcludedTable(String),

    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
