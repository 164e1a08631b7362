//! In-memory accumulation of per-table row count deltas.

use crate::types::{DeltaRecord, TableId};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Sharded map of pending deltas.
///
/// Every update and every drain of a shard happens under that shard's lock,
/// so a concurrent update lands either in the drained batch or in the next
/// one, never both.
pub struct DeltaTracker {
    shards: Vec<Mutex<AHashMap<TableId, DeltaRecord>>>,
}

impl DeltaTracker {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(AHashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, table_id: TableId) -> &Mutex<AHashMap<TableId, DeltaRecord>> {
        let idx = (table_id as u64 % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub fn record_delta(&self, table_id: TableId, delta_count: i64, delta_modify_count: i64) {
        debug_assert!(delta_modify_count >= 0);
        self.shard(table_id)
            .lock()
            .entry(table_id)
            .or_default()
            .merge(DeltaRecord {
                delta_count,
                delta_modify_count,
            });
    }

    /// Swaps out every pending record, leaving the tracker empty.
    pub fn drain_all(&self) -> HashMap<TableId, DeltaRecord> {
        let mut drained = HashMap::new();
        for shard in &self.shards {
            let taken = std::mem::take(&mut *shard.lock());
            drained.extend(taken);
        }
        drained
    }

    /// Removes and returns the pending record of one table.
    pub fn take(&self, table_id: TableId) -> Option<DeltaRecord> {
        self.shard(table_id).lock().remove(&table_id)
    }

    /// Puts a record that failed to flush back, merging with anything
    /// recorded since it was drained.
    pub fn merge_back(&self, table_id: TableId, record: DeltaRecord) {
        if record.is_zero() {
            return;
        }
        self.shard(table_id).lock().entry(table_id).or_default().merge(record);
    }

    pub fn pending(&self, table_id: TableId) -> DeltaRecord {
        self.shard(table_id)
            .lock()
            .get(&table_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_and_drain() {
        let tracker = DeltaTracker::new(4);
        tracker.record_delta(1, 1, 1);
        tracker.record_delta(1, 3, 3);
        tracker.record_delta(2, -1, 1);

        let drained = tracker.drain_all();
        assert_eq!(drained[&1], DeltaRecord { delta_count: 4, delta_modify_count: 4 });
        assert_eq!(drained[&2], DeltaRecord { delta_count: -1, delta_modify_count: 1 });
        assert!(tracker.is_empty());
        assert!(tracker.drain_all().is_empty());
    }

    #[test]
    fn test_take_and_merge_back() {
        let tracker = DeltaTracker::new(2);
        tracker.record_delta(7, 2, 2);
        let taken = tracker.take(7).unwrap();
        assert!(tracker.take(7).is_none());

        tracker.record_delta(7, 1, 1);
        tracker.merge_back(7, taken);
        assert_eq!(tracker.pending(7), DeltaRecord { delta_count: 3, delta_modify_count: 3 });
    }

    #[test]
    fn test_negative_table_ids_shard() {
        let tracker = DeltaTracker::new(3);
        tracker.record_delta(-5, 1, 1);
        assert_eq!(tracker.pending(-5).delta_count, 1);
    }

    #[test]
    fn test_concurrent_updates_never_lost_during_drain() {
        let tracker = Arc::new(DeltaTracker::new(8));
        let done = Arc::new(AtomicBool::new(false));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..5_000 {
                        tracker.record_delta((w * 10 + i % 10) as i64, 1, 1);
                    }
                })
            })
            .collect();

        let drainer = {
            let tracker = tracker.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut total = 0i64;
                while !done.load(Ordering::SeqCst) {
                    total += tracker.drain_all().values().map(|r| r.delta_count).sum::<i64>();
                    thread::sleep(std::time::Duration::from_micros(fastrand::u64(0..200)));
                }
                total
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let mut total = drainer.join().unwrap();
        total += tracker.drain_all().values().map(|r| r.delta_count).sum::<i64>();
        assert_eq!(total, 4 * 5_000);
    }
}
