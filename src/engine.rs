//! The [`SyncEngine`] handle and its background tasks.
//!
//! Four tasks run while the engine is started:
//!
//! - Push Worker: drains the Operation Log every `push_interval`, then
//!   refreshes from the Remote Store when the log was empty
//! - Health Monitor: probes the Remote Store every `health_interval`, or
//!   sooner when a worker reports it unreachable
//! - Sequence Reconciler: resets remote counters for tables a push touched
//! - Bootstrap: one pull and a full sequence repair once the engine first
//!   comes online
//!
//! The online flag lives in a `watch` channel. The Health Monitor is its
//! only writer; everything else reads it or asks for a probe.

use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sync_core::{
    ColumnAliases, Operation, Payload, RemoteStore, SchemaRegistry, StoreError, SyncOperation,
    TableSchema,
};
use ritel_sync_sqlite::SqliteStore;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::initial_sync::InitialSyncOutcome;
use crate::pull::{PullReport, TableRefresh};
use crate::push::PushReport;
use crate::sequence::ReconcileReport;
use crate::{health, initial_sync, pull, push, queue, sequence};

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub online: bool,
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

/// State shared by the engine handle and its tasks.
pub(crate) struct Context {
    pub(crate) local: SqliteStore,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) config: EngineConfig,
    pub(crate) timezone: Tz,
    pub(crate) aliases: ColumnAliases,
    registry: RwLock<SchemaRegistry>,
    online: watch::Sender<bool>,
    /// Wakes the Health Monitor ahead of its tick
    probe_requested: Notify,
    /// Serializes push and pull so a refresh never interleaves with replay
    pub(crate) replication: Mutex<()>,
    reconcile_tx: StdMutex<Option<mpsc::UnboundedSender<Vec<String>>>>,
    shutdown: CancellationToken,
}

impl Context {
    pub(crate) fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a probe result. Returns true on a transition.
    pub(crate) fn set_online(&self, online: bool) -> bool {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Ask the Health Monitor to re-probe now.
    pub(crate) fn request_probe(&self) {
        self.probe_requested.notify_one();
    }

    /// Hand tables to the Sequence Reconciler without waiting for it.
    pub(crate) fn schedule_reconcile(&self, tables: Vec<String>) {
        let guard = match self.reconcile_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) if tx.send(tables).is_ok() => {}
            _ => debug!("Sequence reconciler not running, skipping"),
        }
    }

    /// Run a Remote Store call under the configured deadline. An expired
    /// deadline counts as unreachable.
    pub(crate) async fn remote_call<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Connectivity(format!(
                "no response within {:?}",
                self.config.remote_timeout
            ))),
        }
    }

    /// Schema of a local table, introspected on first use.
    pub(crate) async fn schema_for(&self, table: &str) -> Result<Option<TableSchema>> {
        if let Some(schema) = self.registry.read().await.get(table) {
            return Ok(Some(schema.clone()));
        }
        let Some(schema) = self.local.table_schema(table).await? else {
            return Ok(None);
        };
        self.registry.write().await.register(schema.clone());
        Ok(Some(schema))
    }

    /// Re-introspect every syncable local table.
    pub(crate) async fn refresh_registry(&self) -> Result<Vec<TableSchema>> {
        let mut registry = SchemaRegistry::new();
        let mut schemas = Vec::new();
        for table in self.local.tables().await? {
            if !self.config.is_syncable(&table) {
                continue;
            }
            if let Some(schema) = self.local.table_schema(&table).await? {
                registry.register(schema.clone());
                schemas.push(schema);
            }
        }
        *self.registry.write().await = registry;
        Ok(schemas)
    }

    /// Names of syncable local tables, freshly listed.
    pub(crate) async fn syncable_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .local
            .tables()
            .await?
            .into_iter()
            .filter(|t| self.config.is_syncable(t))
            .collect())
    }
}

/// Offline-first replication engine.
///
/// Construct one at startup and share it by reference. Application writes
/// go to the Local Store and are recorded with [`SyncEngine::enqueue`] (or
/// by the capture triggers); everything else happens in the background
/// once [`SyncEngine::start`] is called.
pub struct SyncEngine {
    ctx: Arc<Context>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Prepare the Local Store and build the engine. Starts offline; no
    /// Remote Store call is made here.
    pub async fn new(
        local: SqliteStore,
        remote: Arc<dyn RemoteStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;
        let aliases = config.aliases();

        local.ensure_queue_schema().await?;
        // A process that died mid-refresh leaves capture paused.
        local
            .set_meta(ritel_sync_sqlite::queue::META_PAUSED, "0")
            .await?;

        let (online, _) = watch::channel(false);
        let ctx = Arc::new(Context {
            local,
            remote,
            config,
            timezone,
            aliases,
            registry: RwLock::new(SchemaRegistry::new()),
            online,
            probe_requested: Notify::new(),
            replication: Mutex::new(()),
            reconcile_tx: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let schemas = ctx.refresh_registry().await?;
        info!(
            "Sync engine ready: {} syncable tables in {}",
            schemas.len(),
            ctx.local.label()
        );

        if ctx.config.auto_capture {
            let installed = ctx.local.install_capture(&schemas).await?;
            info!("Write capture installed on {installed} tables");
        }

        Ok(Self {
            ctx,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the background tasks. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            warn!("Sync engine already started");
            return;
        }

        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        {
            let mut slot = match self.ctx.reconcile_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(reconcile_tx);
        }

        tasks.push(tokio::spawn(health_worker(Arc::clone(&self.ctx))));
        tasks.push(tokio::spawn(push_worker(Arc::clone(&self.ctx))));
        tasks.push(tokio::spawn(reconcile_worker(
            Arc::clone(&self.ctx),
            reconcile_rx,
        )));
        tasks.push(tokio::spawn(bootstrap(Arc::clone(&self.ctx))));
        info!("Sync engine started");
    }

    /// Stop every task. In-flight cycles finish before their task exits.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Sync task ended abnormally: {e}");
            }
        }
        info!("Sync engine stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a local write for replication.
    ///
    /// Never touches the Remote Store. Returns `None` when the table is
    /// excluded from sync.
    pub async fn enqueue(
        &self,
        table: &str,
        operation: Operation,
        record_key: &str,
        payload: Payload,
    ) -> Result<Option<i64>> {
        queue::enqueue(&self.ctx, table, operation, record_key, payload).await
    }

    pub fn is_online(&self) -> bool {
        self.ctx.is_online()
    }

    /// Subscribe to online/offline transitions.
    pub fn online_changes(&self) -> watch::Receiver<bool> {
        self.ctx.online.subscribe()
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        let queue = self.ctx.local.queue_stats().await?;
        Ok(SyncStats {
            online: self.is_online(),
            pending: queue.pending,
            synced: queue.synced,
            failed: queue.failed,
        })
    }

    /// One Health Monitor probe.
    pub async fn probe_health(&self) -> bool {
        health::probe(&self.ctx).await
    }

    /// One Push Worker cycle. Does nothing while offline.
    pub async fn push_cycle(&self) -> Result<PushReport> {
        push::push_cycle(&self.ctx).await
    }

    /// One pass of the Pull Worker over every syncable table.
    pub async fn pull_cycle(&self) -> Result<PullReport> {
        pull::pull_cycle(&self.ctx).await
    }

    /// Manual full Remote to Local refresh.
    pub async fn trigger_force_pull(&self) -> Result<PullReport> {
        info!("Manual force pull triggered (remote -> local)");
        self.pull_cycle().await
    }

    /// Refresh a single table from the Remote Store.
    pub async fn pull_table(&self, table: &str) -> Result<TableRefresh> {
        pull::pull_table(&self.ctx, table).await
    }

    /// One-time full Local to Remote push of every table.
    pub async fn trigger_initial_sync(&self, force: bool) -> Result<InitialSyncOutcome> {
        initial_sync::trigger(&self.ctx, force).await
    }

    /// Reset remote counters for `tables`, or for every syncable table when
    /// `tables` is empty.
    pub async fn reconcile_sequences(&self, tables: &[String]) -> ReconcileReport {
        sequence::reconcile(&self.ctx, tables).await
    }

    /// Move every `failed` operation back to `pending` with a fresh budget.
    pub async fn reset_failed(&self) -> Result<usize> {
        queue::reset_failed(&self.ctx).await
    }

    /// Delete queued operations for scratch and device-local tables.
    pub async fn purge_ignored(&self) -> Result<usize> {
        queue::purge_ignored(&self.ctx).await
    }

    /// Most recent failed operations, newest first.
    pub async fn failed_operations(&self, limit: usize) -> Result<Vec<SyncOperation>> {
        Ok(self.ctx.local.failed_operations(limit).await?)
    }

    /// Delete `synced` operations older than `age`.
    pub async fn vacuum_synced(&self, age: Duration) -> Result<usize> {
        queue::vacuum_synced(&self.ctx, age).await
    }

    pub async fn log_queue_diagnostics(&self) -> Result<()> {
        queue::log_diagnostics(&self.ctx).await
    }

    /// Install write-capture triggers on every syncable table with a
    /// primary key. Returns the number of tables instrumented.
    pub async fn install_capture(&self) -> Result<usize> {
        let schemas = self.ctx.refresh_registry().await?;
        Ok(self.ctx.local.install_capture(&schemas).await?)
    }

    /// The Local Store, for application reads and writes.
    pub fn local(&self) -> &SqliteStore {
        &self.ctx.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn health_worker(ctx: Arc<Context>) {
    let mut interval = ticker(ctx.config.health_interval);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = interval.tick() => {}
            _ = ctx.probe_requested.notified() => {}
        }
        health::probe(&ctx).await;
    }
    debug!("Health monitor stopped");
}

async fn push_worker(ctx: Arc<Context>) {
    info!("Push worker started");
    let mut interval = ticker(ctx.config.push_interval);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !ctx.is_online() {
            ctx.request_probe();
            continue;
        }

        let was_empty = match ctx.local.queue_stats().await {
            Ok(stats) => stats.pending == 0,
            Err(e) => {
                error!("Failed to read queue stats: {e}");
                continue;
            }
        };

        if let Err(e) = push::push_cycle(&ctx).await {
            error!("Error processing pending operations: {e}");
        }

        if was_empty && ctx.is_online() {
            if let Err(e) = pull::pull_cycle(&ctx).await {
                warn!("Error refreshing from remote: {e}");
            }
        }
    }
    debug!("Push worker stopped");
}

async fn reconcile_worker(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<Vec<String>>) {
    loop {
        let first = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            tables = rx.recv() => match tables {
                Some(tables) => tables,
                None => break,
            },
        };

        // Fold queued requests into one pass.
        let mut tables: BTreeSet<String> = first.into_iter().collect();
        while let Ok(more) = rx.try_recv() {
            tables.extend(more);
        }

        let tables: Vec<String> = tables.into_iter().collect();
        let report = sequence::reconcile(&ctx, &tables).await;
        debug!("Post-push sequence reconciliation: {report:?}");
    }
    debug!("Sequence reconciler stopped");
}

async fn bootstrap(ctx: Arc<Context>) {
    let mut online = ctx.online.subscribe();
    let came_online = async move { online.wait_for(|online| *online).await.is_ok() };
    let reached = tokio::select! {
        _ = ctx.shutdown.cancelled() => false,
        ok = came_online => ok,
    };
    if !reached {
        return;
    }

    match ctx.local.queue_stats().await {
        Ok(stats) if stats.pending == 0 => {
            info!("Bootstrap: checking for remote updates");
            match pull::pull_cycle(&ctx).await {
                Ok(report) => info!(
                    "Bootstrap pull completed: {} tables refreshed",
                    report.tables.len()
                ),
                Err(e) => warn!("Bootstrap pull failed: {e}"),
            }
        }
        Ok(stats) => info!(
            "Bootstrap: {} operations pending, deferring pull",
            stats.pending
        ),
        Err(e) => warn!("Bootstrap: failed to read queue stats: {e}"),
    }

    info!("Bootstrap: repairing remote sequences");
    let report = sequence::reconcile(&ctx, &[]).await;
    info!(
        "Bootstrap sequence repair: {} reset, {} widened, {} failed",
        report.reset.len(),
        report.widened.len(),
        report.failed.len()
    );
}
