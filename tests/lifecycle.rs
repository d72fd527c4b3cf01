//! Background workers: start, replicate, shut down.

mod common;

use common::{local_rows, local_store, payload, test_config, FlakyRemote};
use ritel_sync::SyncEngine;
use ritel_sync_sqlite::queue::META_PAUSED;
use serde_json::json;
use std::time::Duration;
use sync_core::{Operation, SqlValue};

const LOCAL: &str = "
    CREATE TABLE produk (id INTEGER PRIMARY KEY, nama TEXT);
    CREATE TABLE kategori (id INTEGER PRIMARY KEY, nama TEXT);
";

const REMOTE: &str = "
    CREATE TABLE produk (id INTEGER PRIMARY KEY, nama TEXT);
    CREATE TABLE kategori (id INTEGER PRIMARY KEY, nama TEXT);
    INSERT INTO kategori VALUES (1, 'Minuman');
";

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_workers_push_and_pull() {
    let local = local_store(LOCAL).await;
    // Left over from a refresh that crashed midway.
    local.ensure_queue_schema().await.unwrap();
    local.set_meta(META_PAUSED, "1").await.unwrap();

    let remote = FlakyRemote::new(REMOTE).await;
    let engine = SyncEngine::new(local, remote.clone(), test_config())
        .await
        .unwrap();
    assert_eq!(
        engine.local().meta(META_PAUSED).await.unwrap().as_deref(),
        Some("0")
    );
    assert!(!engine.is_online());

    engine.start();
    let mut online = engine.online_changes();
    tokio::time::timeout(Duration::from_secs(5), online.wait_for(|online| *online))
        .await
        .unwrap()
        .unwrap();

    engine
        .enqueue(
            "produk",
            Operation::Insert,
            "1",
            payload(json!({"id": 1, "nama": "Gula"})),
        )
        .await
        .unwrap();

    let engine = &engine;
    eventually(|| async move { engine.stats().await.unwrap().synced == 1 }).await;
    assert_eq!(remote.rows("SELECT nama FROM produk").await.len(), 1);

    eventually(|| async move {
        local_rows(engine, "SELECT nama FROM kategori").await
            == vec![vec![SqlValue::Text("Minuman".into())]]
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_start_recovers() {
    let local = local_store(LOCAL).await;
    let remote = FlakyRemote::new(REMOTE).await;
    remote.set_online(false);
    let engine = SyncEngine::new(local, remote.clone(), test_config())
        .await
        .unwrap();
    engine.start();

    engine
        .enqueue(
            "produk",
            Operation::Insert,
            "2",
            payload(json!({"id": 2, "nama": "Kopi"})),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!engine.is_online());
    assert_eq!(engine.stats().await.unwrap().pending, 1);

    remote.set_online(true);
    let engine = &engine;
    eventually(|| async move { engine.stats().await.unwrap().synced == 1 }).await;
    assert!(engine.is_online());

    engine.shutdown().await;
}
