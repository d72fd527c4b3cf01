//! Shared fixtures: an in-memory Local Store and a second in-memory SQLite
//! database standing in for the Remote Store, behind a switch that makes it
//! unreachable.

#![allow(dead_code)]

use async_trait::async_trait;
use ritel_sync::{EngineConfig, SyncEngine};
use ritel_sync_sqlite::SqliteStore;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{Dialect, Payload, RemoteStore, Row, SqlValue, StoreError};

pub struct FlakyRemote {
    store: SqliteStore,
    online: AtomicBool,
    /// Queries mentioning this table fail
    broken_table: Mutex<Option<String>>,
    /// Statements mentioning this table stall before running
    slow_table: Mutex<Option<(String, Duration)>>,
    /// The next sequence reset reports an overflowed counter
    overflow_next_reset: AtomicBool,
    pub resets: AtomicUsize,
    pub widenings: AtomicUsize,
}

impl FlakyRemote {
    pub async fn new(schema: &str) -> Arc<Self> {
        let store = SqliteStore::open_in_memory().unwrap();
        let schema = schema.to_string();
        store
            .with_conn(move |conn| conn.execute_batch(&schema))
            .await
            .unwrap();
        Arc::new(Self {
            store,
            online: AtomicBool::new(true),
            broken_table: Mutex::new(None),
            slow_table: Mutex::new(None),
            overflow_next_reset: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            widenings: AtomicUsize::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn break_table(&self, table: &str) {
        *self.broken_table.lock().unwrap() = Some(format!("\"{table}\""));
    }

    pub fn slow_table(&self, table: &str, delay: Duration) {
        *self.slow_table.lock().unwrap() = Some((format!("\"{table}\""), delay));
    }

    pub fn overflow_next_reset(&self) {
        self.overflow_next_reset.store(true, Ordering::SeqCst);
    }

    async fn stall(&self, sql: &str) {
        let slow = self.slow_table.lock().unwrap().clone();
        if let Some((table, delay)) = slow {
            if sql.contains(&table) {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Direct access, bypassing the switch.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub async fn rows(&self, sql: &str) -> Vec<Row> {
        self.store.query(sql, &[]).await.unwrap()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connectivity("connection refused".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    fn dialect(&self) -> &dyn Dialect {
        self.store.dialect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        self.store.ping().await
    }

    async fn columns_of(&self, table: &str) -> Result<Option<BTreeSet<String>>, StoreError> {
        self.check()?;
        self.store.columns_of(table).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.check()?;
        self.stall(sql).await;
        self.store.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.check()?;
        let broken = self.broken_table.lock().unwrap().clone();
        if let Some(table) = broken {
            if sql.contains(&table) {
                return Err(StoreError::Other(format!("relation {table} is corrupt")));
            }
        }
        self.stall(sql).await;
        self.store.query(sql, params).await
    }

    async fn reset_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError> {
        self.check()?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.overflow_next_reset.swap(false, Ordering::SeqCst) {
            return Err(StoreError::SequenceOverflow(format!(
                "nextval: reached maximum value of sequence \"{table}_{key_column}_seq\""
            )));
        }
        self.store.reset_sequence(table, key_column).await
    }

    async fn widen_sequence(&self, table: &str, key_column: &str) -> Result<(), StoreError> {
        self.check()?;
        self.widenings.fetch_add(1, Ordering::SeqCst);
        self.store.widen_sequence(table, key_column).await
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        push_interval: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        remote_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

pub async fn local_store(schema: &str) -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    let schema = schema.to_string();
    store
        .with_conn(move |conn| conn.execute_batch(&schema))
        .await
        .unwrap();
    store
}

pub async fn engine_with(
    local_schema: &str,
    remote_schema: &str,
    config: EngineConfig,
) -> (SyncEngine, Arc<FlakyRemote>) {
    let local = local_store(local_schema).await;
    let remote = FlakyRemote::new(remote_schema).await;
    let engine = SyncEngine::new(local, remote.clone(), config).await.unwrap();
    (engine, remote)
}

pub async fn engine(local_schema: &str, remote_schema: &str) -> (SyncEngine, Arc<FlakyRemote>) {
    engine_with(local_schema, remote_schema, test_config()).await
}

pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

/// Run statements against the engine's Local Store.
pub async fn exec_local(engine: &SyncEngine, sql: &str) {
    let sql = sql.to_string();
    engine
        .local()
        .with_conn(move |conn| conn.execute_batch(&sql))
        .await
        .unwrap();
}

pub async fn local_rows(engine: &SyncEngine, sql: &str) -> Vec<Row> {
    engine.local().query(sql, &[]).await.unwrap()
}
