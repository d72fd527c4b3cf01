//! PostgreSQL Remote Store for ritel-sync
//!
//! [`PostgresStore`] implements [`RemoteStore`] over a single lazily
//! (re)connecting `tokio_postgres` client. The connection is opened on
//! first use and replaced transparently once the driver reports it closed,
//! so the engine's health probe doubles as the reconnect path.

pub mod error;
pub mod schema;
pub mod value;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use sync_core::{Dialect, PostgresDialect, RemoteStore, Row, SqlValue, StoreError};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

pub use error::classify;

/// Remote Store backed by PostgreSQL.
pub struct PostgresStore {
    /// libpq-style connection string or `postgresql://` URL
    dsn: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresStore {
    /// Create a store. No connection is made until first use.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            client: Mutex::new(None),
        }
    }

    /// Current client, connecting if there is none or the last one closed.
    pub async fn client(&self) -> Result<Arc<Client>, StoreError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            debug!("PostgreSQL connection closed, reconnecting");
        }

        let (client, connection) = tokio_postgres::connect(&self.dsn, NoTls)
            .await
            .map_err(classify)?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {e}");
            }
        });

        info!("Connected to PostgreSQL");
        let client = Arc::new(client);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the cached client so the next call reconnects.
    async fn invalidate(&self) {
        *self.client.lock().await = None;
    }

    async fn classify_and_reset(&self, err: tokio_postgres::Error) -> StoreError {
        let err = classify(err);
        if err.is_connectivity() {
            self.invalidate().await;
        }
        err
    }

    /// Primary key columns of `table`, in key order.
    pub async fn primary_key(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let client = self.client().await?;
        match schema::primary_key_columns(&client, table).await {
            Ok(columns) => Ok(columns),
            Err(e) => Err(self.classify_and_reset(e).await),
        }
    }
}

#[async_trait]
impl RemoteStore for PostgresStore {
    fn dialect(&self) -> &dyn Dialect {
        &PostgresDialect
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        match client.simple_query("SELECT 1").await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify_and_reset(e).await),
        }
    }

    async fn columns_of(&self, table: &str) -> Result<Option<BTreeSet<String>>, StoreError> {
        let client = self.client().await?;
        match schema::column_names(&client, table).await {
            Ok(columns) if columns.is_empty() => Ok(None),
            Ok(columns) => Ok(Some(columns)),
            Err(e) => Err(self.classify_and_reset(e).await),
        }
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let client = self.client().await?;
        let wrapped = value::params(params);
        match client.execute(sql, &value::as_refs(&wrapped)).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.classify_and_reset(e).await),
        }
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let client = self.client().await?;
        let wrapped = value::params(params);
        let rows = match client.query(sql, &value::as_refs(&wrapped)).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.classify_and_reset(e).await),
        };
        rows.iter()
            .map(value::convert_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)
    }

    /// `setval(pg_get_serial_sequence(..), MAX(key) + 1, false)` in one
    /// statement. A key without an owned sequence is a no-op; a non-numeric
    /// key fails `COALESCE` with a datatype mismatch.
    async fn reset_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError> {
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence(quote_ident($1), $2), \
             GREATEST(COALESCE(MAX({key}), 0), 0) + 1, false) FROM {table}",
            key = PostgresDialect.quote_ident(key_column),
            table = PostgresDialect.quote_ident(table),
        );
        self.query(
            &sql,
            &[SqlValue::from(table), SqlValue::from(key_column)],
        )
        .await?;
        Ok(())
    }

    async fn widen_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError> {
        let client = self.client().await?;
        let sequence = match schema::serial_sequence(&client, table, key_column).await {
            Ok(Some(sequence)) => sequence,
            Ok(None) => {
                return Err(StoreError::NonNumericKey(format!(
                    "{table}.{key_column} has no sequence"
                )))
            }
            Err(e) => return Err(self.classify_and_reset(e).await),
        };

        // pg_get_serial_sequence returns an already quoted, qualified name.
        info!("Widening sequence {sequence} to BIGINT");
        match client
            .batch_execute(&format!("ALTER SEQUENCE {sequence} AS BIGINT"))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify_and_reset(e).await),
        }
    }
}
