//! The statistics service: owns every component and the background tasks
//! that keep them moving.

use crate::analyze::{build_column_stats, AnalyzeInput};
use crate::cache::{StatsCache, UpdateSummary};
use crate::config::Config;
use crate::ddl::{DdlConsumer, DdlEvent, EventState};
use crate::delta::DeltaTracker;
use crate::dump::StatsDocument;
use crate::errors::{Result, StatsError};
use crate::flusher::{DeltaFlusher, FlushMode};
use crate::kv::Storage;
use crate::resolver::{timestamp_of, SnapshotResolver};
use crate::schema::{SchemaProvider, TableInfo};
use crate::store::StatsStore;
use crate::types::{TableEntry, TableId, TableStats, Timestamp};
use chrono::{DateTime, Local, SubsecRound};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct StatsHandle {
    config: Config,
    storage: Arc<dyn Storage>,
    schema: Arc<dyn SchemaProvider>,
    store: StatsStore,
    tracker: Arc<DeltaTracker>,
    flusher: DeltaFlusher,
    cache: Arc<StatsCache>,
    resolver: SnapshotResolver,
    ddl: DdlConsumer,
    ddl_tx: mpsc::UnboundedSender<DdlEvent>,
    ddl_rx: Mutex<Option<mpsc::UnboundedReceiver<DdlEvent>>>,
}

/// Running background loops. Dropping this without calling
/// [`BackgroundTasks::shutdown`] leaves the loops running.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Signals every loop and waits for them to finish. The flush loop runs
    /// one last flush on the way out.
    pub async fn shutdown(self) {
        info!("stopping {} background tasks", self.handles.len());
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

impl StatsHandle {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        schema: Arc<dyn SchemaProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let store = StatsStore::new(storage.clone(), config.retry_policy());
        let tracker = Arc::new(DeltaTracker::new(config.delta_shards));
        let cache = Arc::new(StatsCache::new(store.clone(), config.refresh_lag()));
        let (ddl_tx, ddl_rx) = mpsc::unbounded_channel();
        Ok(Self {
            flusher: DeltaFlusher::new(tracker.clone(), store.clone()),
            resolver: SnapshotResolver::new(store.clone()),
            ddl: DdlConsumer::new(store.clone(), cache.clone()),
            config,
            storage,
            schema,
            store,
            tracker,
            cache,
            ddl_tx,
            ddl_rx: Mutex::new(Some(ddl_rx)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<StatsCache> {
        &self.cache
    }

    pub fn schema(&self) -> &Arc<dyn SchemaProvider> {
        &self.schema
    }

    /// Records row changes of a committed user transaction.
    pub fn record_delta(&self, table_id: TableId, delta_count: i64, delta_modify_count: i64) {
        self.tracker.record_delta(table_id, delta_count, delta_modify_count);
    }

    pub async fn dump_stats_delta(&self, mode: FlushMode) -> Result<usize> {
        self.flusher.flush(mode).await
    }

    /// Refreshes the cache against the current schema.
    pub fn update(&self) -> Result<UpdateSummary> {
        self.cache.update(&self.schema.current())
    }

    pub async fn handle_ddl_event(&self, event: &DdlEvent) -> Result<EventState> {
        self.ddl.handle(event).await
    }

    /// Sender side of the DDL event channel consumed by [`StatsHandle::start`].
    pub fn ddl_event_sender(&self) -> mpsc::UnboundedSender<DdlEvent> {
        self.ddl_tx.clone()
    }

    pub fn get_table_stats(&self, table_id: TableId) -> Result<Option<Arc<TableEntry>>> {
        self.cache.get(table_id)
    }

    /// Persists a full analyze of `table_id` built from `inputs`.
    pub async fn analyze_table(
        &self,
        table_id: TableId,
        row_count: i64,
        inputs: &[AnalyzeInput],
    ) -> Result<TableStats> {
        if !self.schema.current().contains(table_id) {
            let msg = format!("table {} is not in the schema", table_id);
            return Err(StatsError::schema_mismatch(msg));
        }
        if let Some(stray) = inputs.iter().find(|i| i.key.table_id != table_id) {
            return Err(StatsError::schema_mismatch(format!(
                "analyze input for table {} passed to table {}",
                stray.key.table_id, table_id
            )));
        }
        let columns: Vec<_> = inputs
            .iter()
            .map(|input| build_column_stats(input, self.config.histogram_buckets))
            .collect();
        let meta = self.store.save_analyze_result(table_id, row_count, &columns).await?;
        self.cache.reload(table_id)?;
        info!("analyzed table {}: {} rows, {} histograms", table_id, row_count, columns.len());
        Ok(meta)
    }

    fn current_table(&self, db: &str, table: &str) -> Result<Arc<TableInfo>> {
        self.schema
            .current()
            .table_by_name(db, table)
            .ok_or_else(|| StatsError::table_not_found(db, table))
    }

    /// Current statistics of `db.table`, `None` if none were collected.
    pub fn dump_stats(&self, db: &str, table: &str) -> Result<Option<StatsDocument>> {
        let info = self.current_table(db, table)?;
        Ok(self
            .cache
            .get(info.id)?
            .map(|entry| StatsDocument::from_entry(db, &info, &entry)))
    }

    /// Statistics of `db.table` as they were at wall-clock time `at`.
    pub fn dump_stats_at(
        &self,
        db: &str,
        table: &str,
        at: &DateTime<Local>,
    ) -> Result<Option<StatsDocument>> {
        let ts = self.resolver.resolve(at)?;
        self.dump_stats_at_ts(db, table, ts)
    }

    /// Statistics of the table named `db.table` at `ts`. The name is
    /// resolved in the schema of that moment, so a table dropped and
    /// recreated since then yields the old table's statistics.
    pub fn dump_stats_at_ts(
        &self,
        db: &str,
        table: &str,
        ts: Timestamp,
    ) -> Result<Option<StatsDocument>> {
        let info = self
            .schema
            .as_of(ts)
            .and_then(|schema| schema.table_by_name(db, table));
        let Some(info) = info else {
            debug!("{}.{} did not exist at {}", db, table, ts);
            return Ok(None);
        };
        Ok(self
            .store
            .read_as_of(ts, info.id)?
            .map(|entry| StatsDocument::from_entry(db, &info, &entry)))
    }

    /// Replaces the statistics of the table a document names.
    pub async fn load_stats(&self, doc: &StatsDocument) -> Result<TableStats> {
        doc.validate()?;
        let info = self
            .schema
            .current()
            .table_by_name(&doc.database_name, &doc.table_name)
            .ok_or_else(|| {
                StatsError::schema_mismatch(format!(
                    "table {}.{} does not exist",
                    doc.database_name, doc.table_name
                ))
            })?;
        let columns = doc.column_stats(&info);
        let meta = self
            .store
            .replace_table_stats(info.id, doc.count, doc.modify_count, &columns)
            .await?;
        self.cache.reload(info.id)?;
        info!(
            "loaded statistics of {}.{} at version {}",
            doc.database_name, doc.table_name, meta.version
        );
        Ok(meta)
    }

    /// Deletes all statistics of `db.table`; the table itself stays.
    pub async fn drop_stats(&self, db: &str, table: &str) -> Result<()> {
        let info = self.current_table(db, table)?;
        let dropped_at = self.store.delete_table_stats(info.id).await?;
        self.cache.evict(info.id, dropped_at);
        info!("dropped statistics of {}.{}", db, table);
        Ok(())
    }

    /// Advances the GC safe point to `safe_point`, truncated to whole
    /// seconds, and physically removes versions older than it. Returns the
    /// number of removed versions.
    pub async fn collect_garbage(&self, safe_point: &DateTime<Local>) -> Result<usize> {
        // The persisted safe point has second precision; GC must not go past it.
        let safe_point = safe_point.trunc_subsecs(0);
        self.resolver.set_safe_point(&safe_point).await?;
        let removed = self.storage.gc(timestamp_of(&safe_point));
        info!("gc to {} removed {} versions", safe_point, removed);
        Ok(removed)
    }

    /// Spawns the flush, cache refresh and DDL loops. Can only be called
    /// once per handle.
    pub fn start(&self) -> Result<BackgroundTasks> {
        let ddl_rx = self
            .ddl_rx
            .lock()
            .take()
            .ok_or_else(|| StatsError::Config("background tasks already started".to_string()))?;
        let (shutdown, rx) = watch::channel(false);

        let handles = vec![
            (
                "delta flush",
                tokio::spawn(self.flusher.clone().run(self.config.flush_interval(), rx.clone())),
            ),
            (
                "stats cache refresh",
                tokio::spawn(
                    self.cache
                        .clone()
                        .run(self.schema.clone(), self.config.refresh_interval(), rx.clone()),
                ),
            ),
            ("ddl event", tokio::spawn(self.ddl.clone().run(ddl_rx, rx))),
        ];
        Ok(BackgroundTasks { shutdown, handles })
    }
}
