//! Core types for the ritel-sync replication engine.
//!
//! This crate holds everything that is shared between the Local Store
//! (SQLite), the Remote Store (PostgreSQL) and the engine itself:
//!
//! - [`SqlValue`] - Backend-neutral column value
//! - [`SyncOperation`], [`Operation`], [`OpStatus`] - Operation Log records
//! - [`StoreError`] - Error taxonomy both stores classify their native errors into
//! - [`Dialect`] and the statement builders in [`dialect`]
//! - [`ColumnMapping`] / [`ColumnAliases`] - Local to Remote column translation
//! - [`timestamp`] - Timestamp normalization to the canonical UTC wire format
//! - [`SchemaRegistry`] - Typed per-table payload validation
//! - [`RemoteStore`] - The seam the engine talks to the central store through
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── ritel-sync-sqlite      (Local Store, also usable as a RemoteStore)
//!    ├─── ritel-sync-postgresql  (Remote Store)
//!    └─── ritel-sync             (engine: push, pull, health, sequences)
//! ```

pub mod dialect;
pub mod error;
pub mod offline_id;
pub mod schema;
pub mod store;
pub mod timestamp;
pub mod types;
pub mod values;

pub use dialect::{
    delete_sql, select_sql, upsert_sql, ColumnAliases, ColumnMapping, Dialect, PostgresDialect,
    SqliteDialect,
};
pub use error::StoreError;
pub use schema::{PayloadError, SchemaRegistry, TableSchema};
pub use store::{RemoteStore, Row};
pub use timestamp::ParseError;
pub use types::{OpStatus, Operation, QueueStats, SyncOperation};
pub use values::{record_key, Payload, SqlValue, KEY_SEPARATOR};
