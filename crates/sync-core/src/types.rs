//! Operation Log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::values::Payload;

/// Kind of mutation recorded in the Operation Log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Insert and Update both replay as a keyed upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("Unknown operation type: {s}")),
        }
    }
}

/// Lifecycle state of a queued operation.
///
/// `Pending` moves to `Synced` (terminal) or stays `Pending` with a bumped
/// retry count, and becomes `Failed` (terminal) once the retry budget is
/// spent. Only an operator reset moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Synced,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown sync status: {s}")),
        }
    }
}

/// One row of `sync_queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: i64,
    pub table: String,
    pub operation: Operation,
    pub record_key: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: OpStatus,
    /// Bumped whenever a newer write to the same record is coalesced into
    /// this operation. Completion is only recorded against the revision that
    /// was actually pushed.
    pub revision: u32,
}

/// Counts of queued operations per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parse_is_case_insensitive() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("DELETE".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("MERGE".parse::<Operation>().is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [OpStatus::Pending, OpStatus::Synced, OpStatus::Failed] {
            assert_eq!(status.as_str().parse::<OpStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_upsert_kinds() {
        assert!(Operation::Insert.is_upsert());
        assert!(Operation::Update.is_upsert());
        assert!(!Operation::Delete.is_upsert());
    }
}
