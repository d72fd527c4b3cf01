//! The Remote Store seam.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::dialect::Dialect;
use crate::error::StoreError;
use crate::values::SqlValue;

/// One result row, in select-list order.
pub type Row = Vec<SqlValue>;

/// Central store the engine replicates to and refreshes from.
///
/// Implementations classify their native errors into [`StoreError`]; the
/// engine relies on `Connectivity` and `UniqueViolation` in particular.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// SQL dialect statements sent to this store are rendered in
    fn dialect(&self) -> &dyn Dialect;

    /// Liveness check. Must fail with `Connectivity` when unreachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Live column set of `table`, or `None` if the table does not exist.
    async fn columns_of(&self, table: &str) -> Result<Option<BTreeSet<String>>, StoreError>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;

    /// Advance the auto-increment counter behind `key_column` past
    /// `MAX(key_column)`.
    ///
    /// Returns `SequenceOverflow` when the counter type is too narrow and
    /// `NonNumericKey` when the key has no sequence.
    async fn reset_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError>;

    /// Widen the counter behind `key_column` to 64 bits.
    async fn widen_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError>;

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.dialect().quote_ident(table));
        let rows = self.query(&sql, &[]).await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }
}
