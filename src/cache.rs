//! Versioned in-memory copy of the persisted statistics, the optimizer's
//! read path.

use crate::errors::Result;
use crate::schema::{InfoSchema, SchemaProvider};
use crate::store::StatsStore;
use crate::types::{TableEntry, TableId, Timestamp};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub refreshed: usize,
    pub evicted: usize,
}

#[derive(Default)]
struct Entries {
    tables: HashMap<TableId, Arc<TableEntry>>,
    /// Start timestamp of the transaction that deleted a table's statistics.
    /// Entries at or below it were read before the delete.
    dropped: HashMap<TableId, Timestamp>,
}

pub struct StatsCache {
    store: StatsStore,
    entries: RwLock<Entries>,
    /// Highest meta version merged so far. The mutex also serializes refreshes.
    last_seen: Mutex<Timestamp>,
    schema_version: AtomicI64,
    refresh_lag: Duration,
}

impl StatsCache {
    pub fn new(store: StatsStore, refresh_lag: Duration) -> Self {
        Self {
            store,
            entries: RwLock::new(Entries::default()),
            last_seen: Mutex::new(Timestamp::ZERO),
            schema_version: AtomicI64::new(0),
            refresh_lag,
        }
    }

    /// Cached statistics of a table, loaded from the store on a miss.
    pub fn get(&self, table_id: TableId) -> Result<Option<Arc<TableEntry>>> {
        if let Some(entry) = self.peek(table_id) {
            return Ok(Some(entry));
        }
        Ok(self
            .store
            .read_latest(table_id)?
            .and_then(|entry| self.publish(entry)))
    }

    /// Cached statistics without touching the store.
    pub fn peek(&self, table_id: TableId) -> Option<Arc<TableEntry>> {
        self.entries.read().tables.get(&table_id).cloned()
    }

    /// Installs `entry` unless the cache already holds the same or a newer
    /// version, and returns whichever entry is now current. An entry read
    /// before its table's statistics were dropped is discarded.
    fn publish(&self, entry: TableEntry) -> Option<Arc<TableEntry>> {
        let table_id = entry.meta.table_id;
        let mut entries = self.entries.write();
        if let Some(held) = entries.tables.get(&table_id) {
            if held.version() >= entry.version() {
                return Some(held.clone());
            }
        }
        if let Some(dropped_at) = entries.dropped.get(&table_id) {
            if entry.version() <= *dropped_at {
                debug!(
                    "discarding table {} version {}, dropped at {}",
                    table_id,
                    entry.version(),
                    dropped_at
                );
                return None;
            }
        }
        entries.dropped.remove(&table_id);
        let entry = Arc::new(entry);
        entries.tables.insert(table_id, entry.clone());
        Some(entry)
    }

    /// Pulls tables updated since the last refresh and evicts tables that
    /// are gone from `schema`.
    pub fn update(&self, schema: &InfoSchema) -> Result<UpdateSummary> {
        let mut last_seen = self.last_seen.lock();
        let since = last_seen.saturating_sub_millis(self.refresh_lag.as_millis() as u64);
        let updated = self.store.scan_updated_since(since)?;

        let mut summary = UpdateSummary::default();
        let mut max_version = *last_seen;
        for meta in updated {
            max_version = max_version.max(meta.version);
            if !schema.contains(meta.table_id) {
                continue;
            }
            if self.peek(meta.table_id).is_some_and(|held| held.version() >= meta.version) {
                continue;
            }
            match self.store.read_latest(meta.table_id)? {
                Some(entry) => {
                    max_version = max_version.max(entry.version());
                    if self.publish(entry).is_some() {
                        summary.refreshed += 1;
                    }
                }
                None => debug!("table {} vanished during refresh", meta.table_id),
            }
        }
        *last_seen = max_version;

        {
            let mut entries = self.entries.write();
            let before = entries.tables.len();
            entries.tables.retain(|table_id, _| schema.contains(*table_id));
            entries.dropped.retain(|table_id, _| schema.contains(*table_id));
            summary.evicted = before - entries.tables.len();
        }
        self.schema_version.store(schema.version, Ordering::SeqCst);

        if summary.refreshed > 0 || summary.evicted > 0 {
            debug!(
                "stats cache refreshed {} and evicted {} tables at schema version {}",
                summary.refreshed, summary.evicted, schema.version
            );
        }
        Ok(summary)
    }

    /// Re-reads one table from the store and publishes it.
    pub fn reload(&self, table_id: TableId) -> Result<Option<Arc<TableEntry>>> {
        match self.store.read_latest(table_id)? {
            Some(entry) => Ok(self.publish(entry)),
            None => {
                self.entries.write().tables.remove(&table_id);
                Ok(None)
            }
        }
    }

    /// Forgets a table whose statistics were deleted by the transaction
    /// started at `dropped_at`.
    pub fn evict(&self, table_id: TableId, dropped_at: Timestamp) -> bool {
        let mut entries = self.entries.write();
        let held = entries.dropped.entry(table_id).or_insert(dropped_at);
        *held = (*held).max(dropped_at);
        entries.tables.remove(&table_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_seen_version(&self) -> Timestamp {
        *self.last_seen.lock()
    }

    pub fn schema_version(&self) -> i64 {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Refreshes from `schema` every `interval` until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        schema: Arc<dyn SchemaProvider>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("stats cache refresh loop started, interval {:?}", interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = schema.current();
                    if let Err(e) = self.update(&current) {
                        warn!("stats cache refresh: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("stats cache refresh loop stopped");
    }
}
