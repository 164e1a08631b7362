//! Transactional multi-version key-value substrate.
//!
//! [`Storage`] and [`Transaction`] are the interface the statistics store is
//! written against. [`MemStore`] is an in-memory implementation: every key
//! keeps its committed versions ordered by commit timestamp, transactions
//! read a snapshot at their start timestamp and buffer writes until commit,
//! and commit fails with a conflict if any written key received a newer
//! version after the transaction started.

use crate::errors::{Result, StatsError};
use crate::types::Timestamp;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

pub trait Storage: Send + Sync {
    /// Starts a read-write transaction at a fresh timestamp.
    fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Starts a read-only transaction pinned to `ts`. A `ts` later than the
    /// current time reads at the current time instead.
    fn begin_at(&self, ts: Timestamp) -> Result<Box<dyn Transaction>>;

    /// Allocates a fresh timestamp, greater than every one handed out before.
    fn current_ts(&self) -> Timestamp;

    /// Physically removes versions no snapshot at or after `safe_point` can
    /// observe. Returns the number of versions removed.
    fn gc(&self, safe_point: Timestamp) -> usize;
}

pub trait Transaction: Send {
    fn start_ts(&self) -> Timestamp;

    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    fn set(&mut self, key: Key, value: Value) -> Result<()>;

    fn delete(&mut self, key: Key) -> Result<()>;

    /// Ordered key/value pairs with `start <= key < end`.
    fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>>;

    /// Commits buffered writes and returns the commit timestamp.
    fn commit(self: Box<Self>) -> Result<Timestamp>;
}

/// Committed version of a key; `None` marks a delete.
#[derive(Debug, Clone)]
struct KeyVersion {
    commit_ts: Timestamp,
    value: Option<Value>,
}

#[derive(Debug, Default)]
struct TimestampOracle {
    last: u64,
}

impl TimestampOracle {
    fn next(&mut self) -> Timestamp {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let candidate = Timestamp::compose(physical, 0).0;
        self.last = candidate.max(self.last + 1);
        Timestamp(self.last)
    }

}

#[derive(Debug, Default)]
struct StoreInner {
    oracle: Mutex<TimestampOracle>,
    data: RwLock<BTreeMap<Key, Vec<KeyVersion>>>,
    gc_watermark: RwLock<Timestamp>,
}

impl StoreInner {
    fn check_watermark(&self, ts: Timestamp) -> Result<()> {
        let watermark = *self.gc_watermark.read();
        if ts < watermark {
            return Err(StatsError::SnapshotTooOld { requested: ts, watermark });
        }
        Ok(())
    }

    fn visible(versions: &[KeyVersion], ts: Timestamp) -> Option<&Value> {
        versions
            .iter()
            .rev()
            .find(|v| v.commit_ts <= ts)
            .and_then(|v| v.value.as_ref())
    }
}

/// In-memory MVCC store.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gc_watermark(&self) -> Timestamp {
        *self.inner.gc_watermark.read()
    }

    /// Number of committed versions held for `key`, tombstones included.
    pub fn version_count(&self, key: &[u8]) -> usize {
        self.inner.data.read().get(key).map(|v| v.len()).unwrap_or(0)
    }
}

impl Storage for MemStore {
    fn begin(&self) -> Result<Box<dyn Transaction>> {
        let start_ts = self.inner.oracle.lock().next();
        Ok(Box::new(MemTransaction::new(self.inner.clone(), start_ts, false)))
    }

    fn begin_at(&self, ts: Timestamp) -> Result<Box<dyn Transaction>> {
        self.inner.check_watermark(ts)?;
        // Commits after this point get timestamps above the returned snapshot.
        let ts = ts.min(self.inner.oracle.lock().next());
        Ok(Box::new(MemTransaction::new(self.inner.clone(), ts, true)))
    }

    fn current_ts(&self) -> Timestamp {
        self.inner.oracle.lock().next()
    }

    fn gc(&self, safe_point: Timestamp) -> usize {
        let mut data = self.inner.data.write();
        let mut removed = 0;
        data.retain(|_, versions| {
            // Keep the newest version visible at the safe point and everything after it.
            let keep_from = versions
                .iter()
                .rposition(|v| v.commit_ts <= safe_point)
                .unwrap_or(0);
            removed += keep_from;
            versions.drain(..keep_from);
            let only_tombstone = versions.len() == 1 && versions[0].value.is_none();
            if only_tombstone && versions[0].commit_ts <= safe_point {
                removed += 1;
                versions.clear();
            }
            !versions.is_empty()
        });

        let mut watermark = self.inner.gc_watermark.write();
        if safe_point > *watermark {
            *watermark = safe_point;
        }
        debug!("gc at {} removed {} versions", safe_point, removed);
        removed
    }
}

pub struct MemTransaction {
    store: Arc<StoreInner>,
    start_ts: Timestamp,
    read_only: bool,
    writes: BTreeMap<Key, Option<Value>>,
}

impl MemTransaction {
    fn new(store: Arc<StoreInner>, start_ts: Timestamp, read_only: bool) -> Self {
        Self {
            store,
            start_ts,
            read_only,
            writes: BTreeMap::new(),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StatsError::Storage(format!(
                "snapshot transaction at {} is read-only",
                self.start_ts
            )));
        }
        Ok(())
    }
}

impl Transaction for MemTransaction {
    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        self.store.check_watermark(self.start_ts)?;
        let data = self.store.data.read();
        Ok(data
            .get(key)
            .and_then(|versions| StoreInner::visible(versions, self.start_ts))
            .cloned())
    }

    fn set(&mut self, key: Key, value: Value) -> Result<()> {
        self.check_writable()?;
        self.writes.insert(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, key: Key) -> Result<()> {
        self.check_writable()?;
        self.writes.insert(key, None);
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.store.check_watermark(self.start_ts)?;
        let range = (Bound::Included(start), Bound::Excluded(end));

        let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
        {
            let data = self.store.data.read();
            for (key, versions) in data.range::<[u8], _>(range) {
                if let Some(value) = StoreInner::visible(versions, self.start_ts) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, buffered) in self.writes.range::<[u8], _>(range) {
            match buffered {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> Result<Timestamp> {
        if self.writes.is_empty() {
            return Ok(self.start_ts);
        }
        self.check_writable()?;

        // The data lock is held from conflict check through apply so commit
        // timestamps become visible in allocation order.
        let store = self.store.clone();
        let mut data = store.data.write();
        for key in self.writes.keys() {
            if let Some(latest) = data.get(key).and_then(|v| v.last()) {
                if latest.commit_ts > self.start_ts {
                    let key = String::from_utf8_lossy(key).into_owned();
                    return Err(StatsError::TransientStoreConflict(key));
                }
            }
        }

        let commit_ts = store.oracle.lock().next();
        let MemTransaction { writes, .. } = *self;
        for (key, value) in writes {
            data.entry(key).or_default().push(KeyVersion { commit_ts, value });
        }
        Ok(commit_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemStore, key: &str, value: &str) -> Timestamp {
        let mut txn = store.begin().unwrap();
        txn.set(key.as_bytes().to_vec(), value.as_bytes().to_vec()).unwrap();
        txn.commit().unwrap()
    }

    fn read(store: &MemStore, key: &str) -> Option<String> {
        let txn = store.begin().unwrap();
        txn.get(key.as_bytes())
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    #[test]
    fn test_commit_and_read() {
        let store = MemStore::new();
        put(&store, "a", "1");
        assert_eq!(read(&store, "a"), Some("1".to_string()));
        assert_eq!(read(&store, "b"), None);
    }

    #[test]
    fn test_read_your_own_writes() {
        let store = MemStore::new();
        put(&store, "a", "1");

        let mut txn = store.begin().unwrap();
        txn.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        txn.delete(b"a".to_vec()).unwrap();
        assert_eq!(txn.get(b"a").unwrap(), None);
        assert_eq!(txn.get(b"b").unwrap(), Some(b"2".to_vec()));

        let scanned = txn.scan(b"a", b"z").unwrap();
        assert_eq!(scanned, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn test_snapshot_read() {
        let store = MemStore::new();
        let first = put(&store, "a", "1");
        put(&store, "a", "2");

        let old = store.begin_at(first).unwrap();
        assert_eq!(old.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(read(&store, "a"), Some("2".to_string()));

        let before = store.begin_at(Timestamp(first.0 - 1)).unwrap();
        assert_eq!(before.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_snapshot_is_read_only() {
        let store = MemStore::new();
        let ts = store.current_ts();
        let mut txn = store.begin_at(ts).unwrap();
        assert!(txn.set(b"a".to_vec(), b"1".to_vec()).is_err());
    }

    #[test]
    fn test_write_conflict_detection() {
        let store = MemStore::new();

        let mut tx1 = store.begin().unwrap();
        let mut tx2 = store.begin().unwrap();
        tx1.set(b"k".to_vec(), b"1".to_vec()).unwrap();
        tx2.set(b"k".to_vec(), b"2".to_vec()).unwrap();

        assert!(tx1.commit().is_ok());
        let err = tx2.commit().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(read(&store, "k"), Some("1".to_string()));
    }

    #[test]
    fn test_scan_is_ordered_and_bounded() {
        let store = MemStore::new();
        put(&store, "b", "2");
        put(&store, "a", "1");
        put(&store, "c", "3");
        put(&store, "d", "4");

        let txn = store.begin().unwrap();
        let scanned = txn.scan(b"a", b"d").unwrap();
        let keys: Vec<Vec<u8>> = scanned.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_gc_prunes_and_rejects_old_snapshots() {
        let store = MemStore::new();
        let first = put(&store, "a", "1");
        let second = put(&store, "a", "2");
        put(&store, "a", "3");

        let mut txn = store.begin().unwrap();
        txn.set(b"gone".to_vec(), b"x".to_vec()).unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin().unwrap();
        txn.delete(b"gone".to_vec()).unwrap();
        let deleted_at = txn.commit().unwrap();

        let removed = store.gc(deleted_at);
        assert_eq!(removed, 4);
        assert_eq!(store.version_count(b"a"), 1);
        assert_eq!(store.version_count(b"gone"), 0);
        assert_eq!(read(&store, "a"), Some("3".to_string()));

        assert!(matches!(
            store.begin_at(first),
            Err(StatsError::SnapshotTooOld { .. })
        ));
        assert!(store.begin_at(second).is_err());
        assert!(store.begin_at(deleted_at).is_ok());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let store = MemStore::new();
        let mut last = Timestamp::ZERO;
        for _ in 0..1000 {
            let ts = store.current_ts();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_future_snapshot_reads_at_current_time() {
        let store = MemStore::new();
        let before = store.current_ts();
        let fifty_years_ms = 50 * 365 * 24 * 3_600_000;
        let future = Timestamp::from_millis(before.physical_ms() as i64 + fifty_years_ms);

        let snapshot = store.begin_at(future).unwrap();
        assert!(snapshot.start_ts() > before);
        assert!(snapshot.start_ts() < future);

        let committed = put(&store, "a", "1");
        assert!(committed > snapshot.start_ts());
        assert!(committed < future);
        assert_eq!(snapshot.get(b"a").unwrap(), None);
    }
}
