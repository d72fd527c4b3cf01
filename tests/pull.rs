//! Pull / Bootstrap Worker behavior.

mod common;

use common::{engine, exec_local, local_rows, payload};
use ritel_sync::Error;
use serde_json::json;
use sync_core::{Operation, SqlValue};

const LOCAL: &str = "
    CREATE TABLE transaksi (
        id INTEGER PRIMARY KEY,
        nomor_transaksi TEXT UNIQUE,
        total INTEGER,
        created_at TEXT
    );
    CREATE TABLE kategori (id INTEGER PRIMARY KEY, nama TEXT);
    CREATE TABLE log_harian (pesan TEXT);
    CREATE TABLE print_settings (id INTEGER PRIMARY KEY, printer TEXT);
    INSERT INTO transaksi (id, nomor_transaksi, total) VALUES (1, 'TRX-001', 100);
    INSERT INTO print_settings VALUES (1, 'EPSON-LOKAL');
";

const REMOTE: &str = "
    CREATE TABLE transaksi (
        id INTEGER PRIMARY KEY,
        nomor_transaksi TEXT UNIQUE,
        total INTEGER,
        created_at TEXT,
        cabang TEXT
    );
    CREATE TABLE kategori (id INTEGER PRIMARY KEY, nama TEXT);
    CREATE TABLE print_settings (id INTEGER PRIMARY KEY, printer TEXT);
    INSERT INTO transaksi VALUES
        (2, 'TRX-001', 999, '2026-01-16 07:38:03', 'pusat'),
        (3, 'TRX-003', 300, '2026-01-16T00:38:03+07:00', 'pusat'),
        (4, 'TRX-004', 400, NULL, 'pusat');
    INSERT INTO kategori VALUES (1, 'Minuman');
    INSERT INTO print_settings VALUES (1, 'EPSON-PUSAT');
";

#[tokio::test]
async fn test_conflicting_row_does_not_block_the_table() {
    let (engine, _remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);

    let report = engine.pull_cycle().await.unwrap();
    let transaksi = report
        .tables
        .iter()
        .find(|t| t.table == "transaksi")
        .unwrap();
    assert_eq!(transaksi.fetched, 3);
    assert_eq!(transaksi.applied, 2);
    assert_eq!(transaksi.conflicts, 1);

    let rows = local_rows(&engine, "SELECT id, nomor_transaksi FROM transaksi ORDER BY id").await;
    assert_eq!(
        rows,
        vec![
            vec![SqlValue::Int(1), SqlValue::Text("TRX-001".into())],
            vec![SqlValue::Int(3), SqlValue::Text("TRX-003".into())],
            vec![SqlValue::Int(4), SqlValue::Text("TRX-004".into())],
        ]
    );

    // Timestamps arrive in the canonical UTC form.
    let rows = local_rows(&engine, "SELECT created_at FROM transaksi WHERE id = 3").await;
    assert_eq!(rows, vec![vec![SqlValue::Text("2026-01-15T17:38:03Z".into())]]);

    // Keyless and device-local tables are left alone.
    assert!(report.skipped.contains(&"log_harian".to_string()));
    let rows = local_rows(&engine, "SELECT printer FROM print_settings").await;
    assert_eq!(rows, vec![vec![SqlValue::Text("EPSON-LOKAL".into())]]);
}

#[tokio::test]
async fn test_failed_table_does_not_abort_cycle() {
    let (engine, remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);
    remote.break_table("transaksi");

    let report = engine.pull_cycle().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "transaksi");
    assert!(!report.interrupted);

    let rows = local_rows(&engine, "SELECT nama FROM kategori").await;
    assert_eq!(rows, vec![vec![SqlValue::Text("Minuman".into())]]);
}

#[tokio::test]
async fn test_unpushed_local_changes_win() {
    let (engine, _remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);

    exec_local(&engine, "INSERT INTO transaksi (id, nomor_transaksi, total) VALUES (4, 'TRX-004', 450)").await;
    engine
        .enqueue(
            "transaksi",
            Operation::Insert,
            "4",
            payload(json!({"id": 4, "nomor_transaksi": "TRX-004", "total": 450})),
        )
        .await
        .unwrap();

    let report = engine.trigger_force_pull().await.unwrap();
    let transaksi = report
        .tables
        .iter()
        .find(|t| t.table == "transaksi")
        .unwrap();
    assert_eq!(transaksi.preserved, 1);

    let rows = local_rows(&engine, "SELECT total FROM transaksi WHERE id = 4").await;
    assert_eq!(rows, vec![vec![SqlValue::Int(450)]]);
}

#[tokio::test]
async fn test_pulled_rows_are_not_captured() {
    let (engine, _remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);
    assert!(engine.install_capture().await.unwrap() >= 2);

    engine.pull_cycle().await.unwrap();
    assert_eq!(engine.stats().await.unwrap().pending, 0);

    // Application writes are still captured afterwards.
    exec_local(&engine, "UPDATE kategori SET nama = 'Makanan' WHERE id = 1").await;
    let pending = engine.local().pending_operations(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].table, "kategori");
    assert_eq!(pending[0].record_key, "1");
}

#[tokio::test]
async fn test_round_trip_is_a_no_op() {
    let (engine, remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);
    engine.pull_cycle().await.unwrap();

    let before = remote.rows("SELECT * FROM kategori").await;
    let pulled = local_rows(&engine, "SELECT id, nama FROM kategori").await;
    for row in &pulled {
        engine
            .enqueue(
                "kategori",
                Operation::Update,
                &row[0].to_key_string(),
                payload(json!({"id": row[0].to_json(), "nama": row[1].to_json()})),
            )
            .await
            .unwrap();
    }
    assert_eq!(engine.push_cycle().await.unwrap().synced, pulled.len());

    assert_eq!(remote.rows("SELECT * FROM kategori").await, before);
    assert_eq!(local_rows(&engine, "SELECT id, nama FROM kategori").await, pulled);
}

#[tokio::test]
async fn test_manual_pull_requires_connection() {
    let (engine, remote) = engine(LOCAL, REMOTE).await;
    remote.set_online(false);
    engine.probe_health().await;

    assert!(matches!(
        engine.trigger_force_pull().await,
        Err(Error::RemoteNotConnected)
    ));
    assert!(matches!(
        engine.pull_table("print_settings").await,
        Err(Error::ExcludedTable(_))
    ));
}

#[tokio::test]
async fn test_pull_single_table() {
    let (engine, _remote) = engine(LOCAL, REMOTE).await;
    assert!(engine.probe_health().await);

    let refresh = engine.pull_table("kategori").await.unwrap();
    assert_eq!(refresh.applied, 1);
    assert!(matches!(
        engine.pull_table("tidak_ada").await,
        Err(Error::UnknownTable(_))
    ));
}
