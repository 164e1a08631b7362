//! Merges pending deltas into the persisted table metadata.

use crate::delta::DeltaTracker;
use crate::errors::{Result, StatsError};
use crate::store::StatsStore;
use crate::types::{DeltaRecord, TableId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    DumpAll,
    DumpSingle(TableId),
}

#[derive(Clone)]
pub struct DeltaFlusher {
    tracker: Arc<DeltaTracker>,
    store: StatsStore,
}

impl DeltaFlusher {
    pub fn new(tracker: Arc<DeltaTracker>, store: StatsStore) -> Self {
        Self { tracker, store }
    }

    /// Flushes pending deltas, one store transaction per table.
    ///
    /// Tables whose transaction fails get their delta merged back into the
    /// tracker; the error then names all of them. Returns the number of
    /// tables whose meta row was updated.
    pub async fn flush(&self, mode: FlushMode) -> Result<usize> {
        let batch: Vec<(TableId, DeltaRecord)> = match mode {
            FlushMode::DumpAll => self.tracker.drain_all().into_iter().collect(),
            FlushMode::DumpSingle(table_id) => self
                .tracker
                .take(table_id)
                .map(|r| (table_id, r))
                .into_iter()
                .collect(),
        };

        let mut flushed = 0;
        let mut failed = Vec::new();
        for (table_id, delta) in batch {
            if delta.is_zero() {
                continue;
            }
            match self.store.apply_delta(table_id, delta).await {
                Ok(Some(meta)) => {
                    debug!(
                        "flushed delta {:?} into table {}: count={} modify_count={}",
                        delta, table_id, meta.count, meta.modify_count
                    );
                    flushed += 1;
                }
                Ok(None) => {
                    debug!("table {} has no statistics, dropping delta {:?}", table_id, delta);
                }
                Err(e) => {
                    warn!("flushing delta of table {} failed: {}, re-queued", table_id, e);
                    self.tracker.merge_back(table_id, delta);
                    failed.push(table_id);
                }
            }
        }

        if failed.is_empty() {
            Ok(flushed)
        } else {
            failed.sort_unstable();
            Err(StatsError::FlushFailed { table_ids: failed })
        }
    }

    /// Flushes everything every `interval` until `shutdown` flips, then
    /// flushes one last time.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("delta flush loop started, interval {:?}", interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(FlushMode::DumpAll).await {
                        warn!("periodic delta flush: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.flush(FlushMode::DumpAll).await {
            warn!("final delta flush: {}", e);
        }
        info!("delta flush loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::kv::{MemStore, Storage, Transaction};
    use crate::types::{TableStats, Timestamp};

    /// Store whose commits always lose a conflict.
    struct ConflictingStore(MemStore);

    struct ConflictingTxn(Box<dyn Transaction>);

    impl Transaction for ConflictingTxn {
        fn start_ts(&self) -> Timestamp {
            self.0.start_ts()
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.0.get(key)
        }
        fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
            self.0.set(key, value)
        }
        fn delete(&mut self, key: Vec<u8>) -> Result<()> {
            self.0.delete(key)
        }
        fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.0.scan(start, end)
        }
        fn commit(self: Box<Self>) -> Result<Timestamp> {
            Err(StatsError::TransientStoreConflict("m".to_string()))
        }
    }

    impl Storage for ConflictingStore {
        fn begin(&self) -> Result<Box<dyn Transaction>> {
            Ok(Box::new(ConflictingTxn(self.0.begin()?)))
        }
        fn begin_at(&self, ts: Timestamp) -> Result<Box<dyn Transaction>> {
            self.0.begin_at(ts)
        }
        fn current_ts(&self) -> Timestamp {
            self.0.current_ts()
        }
        fn gc(&self, safe_point: Timestamp) -> usize {
            self.0.gc(safe_point)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    async fn setup(tables: &[TableId]) -> (DeltaFlusher, Arc<DeltaTracker>, StatsStore) {
        let store = StatsStore::new(Arc::new(MemStore::new()), fast_retry());
        for table_id in tables {
            store.upsert_table_meta(TableStats::empty(*table_id, Timestamp::ZERO)).await.unwrap();
        }
        let tracker = Arc::new(DeltaTracker::new(4));
        (DeltaFlusher::new(tracker.clone(), store.clone()), tracker, store)
    }

    #[tokio::test]
    async fn test_flush_all_applies_exact_deltas() {
        let (flusher, tracker, store) = setup(&[1, 2]).await;
        tracker.record_delta(1, 1, 1);
        tracker.record_delta(1, 3, 3);
        tracker.record_delta(2, -1, 1);

        assert_eq!(flusher.flush(FlushMode::DumpAll).await.unwrap(), 2);
        let t1 = store.table_meta(1).unwrap().unwrap();
        let t2 = store.table_meta(2).unwrap().unwrap();
        assert_eq!((t1.count, t1.modify_count), (4, 4));
        assert_eq!((t2.count, t2.modify_count), (-1, 1));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_flush_single_leaves_other_tables() {
        let (flusher, tracker, store) = setup(&[1, 2]).await;
        tracker.record_delta(1, 2, 2);
        tracker.record_delta(2, 5, 5);

        assert_eq!(flusher.flush(FlushMode::DumpSingle(1)).await.unwrap(), 1);
        assert_eq!(store.table_meta(1).unwrap().unwrap().count, 2);
        assert_eq!(store.table_meta(2).unwrap().unwrap().count, 0);
        assert_eq!(tracker.pending(2).delta_count, 5);
    }

    #[tokio::test]
    async fn test_flush_without_stats_discards_delta() {
        let (flusher, tracker, _store) = setup(&[]).await;
        tracker.record_delta(42, 1, 1);
        assert_eq!(flusher.flush(FlushMode::DumpAll).await.unwrap(), 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_delta() {
        let mem = MemStore::new();
        let good = StatsStore::new(Arc::new(mem.clone()), fast_retry());
        good.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();

        let failing = StatsStore::new(Arc::new(ConflictingStore(mem)), fast_retry());
        let tracker = Arc::new(DeltaTracker::new(4));
        let flusher = DeltaFlusher::new(tracker.clone(), failing);

        tracker.record_delta(1, 3, 3);
        let err = flusher.flush(FlushMode::DumpAll).await.unwrap_err();
        assert!(matches!(err, StatsError::FlushFailed { ref table_ids } if table_ids == &vec![1]));
        assert_eq!(tracker.pending(1), DeltaRecord { delta_count: 3, delta_modify_count: 3 });
        assert_eq!(good.table_meta(1).unwrap().unwrap().count, 0);

        // A healthy flusher over the same tracker picks the delta up.
        let healthy = DeltaFlusher::new(tracker.clone(), good.clone());
        healthy.flush(FlushMode::DumpAll).await.unwrap();
        assert_eq!(good.table_meta(1).unwrap().unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_flush_loop_flushes_on_shutdown() {
        let (flusher, tracker, store) = setup(&[1]).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(flusher.run(Duration::from_secs(3600), rx));

        tracker.record_delta(1, 6, 6);
        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(store.table_meta(1).unwrap().unwrap().count, 6);
    }
}
