//! Persistent statistics rows on top of the transactional KV store.
//!
//! Key layout (ids are sign-flipped big-endian so byte order matches
//! numeric order):
//!
//! ```text
//! m{table}                        -> TableStats
//! h{table}{is_index}{hist}        -> HistogramHeader
//! b{table}{is_index}{hist}{idx}   -> Bucket
//! d{table}                        -> last applied DDL event seq
//! tikv_gc_safe_point              -> safe point text
//! ```
//!
//! Any write touching a table's histograms also rewrites its meta row with
//! the writing transaction's start timestamp as the new version. Concurrent
//! writers of one table therefore always conflict on the meta key, which
//! keeps per-table versions strictly increasing.

use crate::config::RetryPolicy;
use crate::errors::{Result, StatsError};
use crate::kv::{Key, Storage, Transaction};
use crate::types::{
    Bucket, ColumnStats, DeltaRecord, HistKey, Histogram, TableEntry, TableId, TableStats,
    Timestamp,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const GC_SAFE_POINT_KEY: &[u8] = b"tikv_gc_safe_point";

const META_PREFIX: u8 = b'm';
const HIST_PREFIX: u8 = b'h';
const BUCKET_PREFIX: u8 = b'b';
const DDL_PREFIX: u8 = b'd';

fn encode_id(id: i64) -> [u8; 8] {
    ((id as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StatsError::Storage(format!("malformed id of {} bytes", bytes.len())))?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn table_key(prefix: u8, table_id: TableId) -> Key {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&encode_id(table_id));
    key
}

fn hist_suffix(mut key: Key, hist: HistKey) -> Key {
    key.push(hist.is_index as u8);
    key.extend_from_slice(&encode_id(hist.hist_id));
    key
}

pub(crate) fn meta_key(table_id: TableId) -> Key {
    table_key(META_PREFIX, table_id)
}

fn hist_key(hist: HistKey) -> Key {
    hist_suffix(table_key(HIST_PREFIX, hist.table_id), hist)
}

fn bucket_key(hist: HistKey, idx: u32) -> Key {
    let mut key = hist_suffix(table_key(BUCKET_PREFIX, hist.table_id), hist);
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn ddl_key(table_id: TableId) -> Key {
    table_key(DDL_PREFIX, table_id)
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Key {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    vec![u8::MAX; prefix.len() + 1]
}

fn decode_hist_key(key: &[u8]) -> Result<HistKey> {
    if key.len() != 18 || key[0] != HIST_PREFIX {
        return Err(StatsError::Storage(format!("malformed histogram key {:?}", key)));
    }
    Ok(HistKey {
        table_id: decode_id(&key[1..9])?,
        is_index: key[9] != 0,
        hist_id: decode_id(&key[10..18])?,
    })
}

/// Histogram row without its buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistogramHeader {
    null_count: i64,
    ndv: i64,
    correlation: f64,
    last_update_version: Timestamp,
}

/// Row-level helpers operating inside one caller-owned transaction.
pub mod rows {
    use super::*;

    pub fn read_meta(txn: &dyn Transaction, table_id: TableId) -> Result<Option<TableStats>> {
        match txn.get(&meta_key(table_id))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn write_meta(txn: &mut dyn Transaction, stats: &TableStats) -> Result<()> {
        txn.set(meta_key(stats.table_id), bincode::serialize(stats)?)
    }

    /// Rewrites the meta row with the transaction's start timestamp as version.
    pub fn bump_version(
        txn: &mut dyn Transaction,
        table_id: TableId,
    ) -> Result<Option<TableStats>> {
        let Some(mut meta) = read_meta(txn, table_id)? else {
            return Ok(None);
        };
        meta.version = txn.start_ts();
        write_meta(txn, &meta)?;
        Ok(Some(meta))
    }

    pub fn read_histograms(txn: &dyn Transaction, table_id: TableId) -> Result<Vec<ColumnStats>> {
        let prefix = table_key(HIST_PREFIX, table_id);
        let mut result = Vec::new();
        for (key, raw) in txn.scan(&prefix, &prefix_end(&prefix))? {
            let hist = decode_hist_key(&key)?;
            let header: HistogramHeader = bincode::deserialize(&raw)?;

            let bucket_prefix = hist_suffix(table_key(BUCKET_PREFIX, table_id), hist);
            let buckets = txn
                .scan(&bucket_prefix, &prefix_end(&bucket_prefix))?
                .into_iter()
                .map(|(_, raw)| bincode::deserialize::<Bucket>(&raw))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            result.push(ColumnStats {
                key: hist,
                histogram: Histogram {
                    buckets,
                    null_count: header.null_count,
                    ndv: header.ndv,
                },
                correlation: header.correlation,
                last_update_version: header.last_update_version,
            });
        }
        Ok(result)
    }

    pub fn read_entry(txn: &dyn Transaction, table_id: TableId) -> Result<Option<TableEntry>> {
        let Some(meta) = read_meta(txn, table_id)? else {
            return Ok(None);
        };
        let mut entry = TableEntry::new(meta);
        for stats in read_histograms(txn, table_id)? {
            entry.insert(stats);
        }
        Ok(Some(entry))
    }

    fn delete_range(txn: &mut dyn Transaction, prefix: &[u8]) -> Result<usize> {
        let keys: Vec<Key> = txn
            .scan(prefix, &prefix_end(prefix))?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let deleted = keys.len();
        for key in keys {
            txn.delete(key)?;
        }
        Ok(deleted)
    }

    /// Replaces one histogram, buckets included.
    pub fn write_histogram(txn: &mut dyn Transaction, stats: &ColumnStats) -> Result<()> {
        let bucket_prefix = hist_suffix(table_key(BUCKET_PREFIX, stats.key.table_id), stats.key);
        delete_range(txn, &bucket_prefix)?;

        let header = HistogramHeader {
            null_count: stats.histogram.null_count,
            ndv: stats.histogram.ndv,
            correlation: stats.correlation,
            last_update_version: stats.last_update_version,
        };
        txn.set(hist_key(stats.key), bincode::serialize(&header)?)?;
        for (idx, bucket) in stats.histogram.buckets.iter().enumerate() {
            txn.set(bucket_key(stats.key, idx as u32), bincode::serialize(bucket)?)?;
        }
        Ok(())
    }

    /// Removes every histogram and bucket row of a table, keeping the meta row.
    pub fn clear_histograms(txn: &mut dyn Transaction, table_id: TableId) -> Result<usize> {
        let hists = delete_range(txn, &table_key(HIST_PREFIX, table_id))?;
        delete_range(txn, &table_key(BUCKET_PREFIX, table_id))?;
        Ok(hists)
    }

    /// Removes meta, histogram and bucket rows of a table.
    pub fn delete_table(txn: &mut dyn Transaction, table_id: TableId) -> Result<()> {
        clear_histograms(txn, table_id)?;
        txn.delete(meta_key(table_id))
    }

    pub fn read_ddl_seq(txn: &dyn Transaction, table_id: TableId) -> Result<Option<u64>> {
        match txn.get(&ddl_key(table_id))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn write_ddl_seq(txn: &mut dyn Transaction, table_id: TableId, seq: u64) -> Result<()> {
        txn.set(ddl_key(table_id), bincode::serialize(&seq)?)
    }
}

/// Durable, versioned statistics storage.
#[derive(Clone)]
pub struct StatsStore {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl StatsStore {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Runs `body` in one transaction and commits it, re-running the whole
    /// transaction with exponential backoff when it loses a conflict.
    pub async fn update<T, F>(&self, op: &str, mut body: F) -> Result<T>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let outcome = {
                let mut txn = self.storage.begin()?;
                match body(txn.as_mut()) {
                    Ok(value) => txn.commit().map(|_| value),
                    Err(e) => Err(e),
                }
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!("{} hit {}, retry {} in {:?}", op, e, attempt, backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn upsert_table_meta(&self, stats: TableStats) -> Result<TableStats> {
        self.update("upsert_table_meta", |txn| {
            let written = TableStats {
                version: txn.start_ts(),
                ..stats
            };
            rows::write_meta(txn, &written)?;
            Ok(written)
        })
        .await
    }

    /// Replaces one column or index histogram. The table must have a meta row.
    pub async fn upsert_histogram(&self, stats: &ColumnStats) -> Result<Timestamp> {
        self.update("upsert_histogram", |txn| {
            let table_id = stats.key.table_id;
            let meta = rows::bump_version(txn, table_id)?.ok_or_else(|| {
                StatsError::schema_mismatch(format!("table {} has no statistics", table_id))
            })?;
            rows::write_histogram(txn, stats)?;
            Ok(meta.version)
        })
        .await
    }

    /// Deletes every statistics row of the table. Returns the start
    /// timestamp of the deleting transaction.
    pub async fn delete_table_stats(&self, table_id: TableId) -> Result<Timestamp> {
        self.update("delete_table_stats", |txn| {
            rows::delete_table(txn, table_id)?;
            Ok(txn.start_ts())
        })
        .await
    }

    /// Adds a pending delta to the table's meta row. Returns `None` without
    /// writing when the table has no statistics.
    pub async fn apply_delta(
        &self,
        table_id: TableId,
        delta: DeltaRecord,
    ) -> Result<Option<TableStats>> {
        self.update("apply_delta", |txn| {
            let Some(mut meta) = rows::read_meta(txn, table_id)? else {
                return Ok(None);
            };
            meta.count += delta.delta_count;
            meta.modify_count += delta.delta_modify_count;
            meta.version = txn.start_ts();
            rows::write_meta(txn, &meta)?;
            Ok(Some(meta))
        })
        .await
    }

    /// Persists a full analyze: row count replaced, modify count reset and
    /// the given histograms replaced.
    pub async fn save_analyze_result(
        &self,
        table_id: TableId,
        count: i64,
        columns: &[ColumnStats],
    ) -> Result<TableStats> {
        self.write_table(table_id, count, 0, columns, false, "save_analyze_result").await
    }

    /// Replaces all statistics of a table: every existing histogram is
    /// cleared before `columns` are written.
    pub async fn replace_table_stats(
        &self,
        table_id: TableId,
        count: i64,
        modify_count: i64,
        columns: &[ColumnStats],
    ) -> Result<TableStats> {
        self.write_table(table_id, count, modify_count, columns, true, "replace_table_stats").await
    }

    async fn write_table(
        &self,
        table_id: TableId,
        count: i64,
        modify_count: i64,
        columns: &[ColumnStats],
        clear_existing: bool,
        op: &str,
    ) -> Result<TableStats> {
        self.update(op, |txn| {
            let version = txn.start_ts();
            if clear_existing {
                rows::clear_histograms(txn, table_id)?;
            }
            let meta = TableStats {
                table_id,
                count,
                modify_count,
                version,
            };
            rows::write_meta(txn, &meta)?;
            for stats in columns {
                let stats = ColumnStats {
                    last_update_version: version,
                    ..stats.clone()
                };
                rows::write_histogram(txn, &stats)?;
            }
            Ok(meta)
        })
        .await
    }

    /// Meta rows with `version > since`, ordered by version.
    pub fn scan_updated_since(&self, since: Timestamp) -> Result<Vec<TableStats>> {
        let txn = self.storage.begin()?;
        let start = [META_PREFIX];
        let mut updated = Vec::new();
        for (_, raw) in txn.scan(&start, &prefix_end(&start))? {
            let meta: TableStats = bincode::deserialize(&raw)?;
            if meta.version > since {
                updated.push(meta);
            }
        }
        updated.sort_by_key(|m| m.version);
        debug!("{} tables updated since {}", updated.len(), since);
        Ok(updated)
    }

    /// Full statistics of a table as of `ts`, through a snapshot transaction.
    pub fn read_as_of(&self, ts: Timestamp, table_id: TableId) -> Result<Option<TableEntry>> {
        let txn = self.storage.begin_at(ts)?;
        rows::read_entry(txn.as_ref(), table_id)
    }

    pub fn read_latest(&self, table_id: TableId) -> Result<Option<TableEntry>> {
        let txn = self.storage.begin()?;
        rows::read_entry(txn.as_ref(), table_id)
    }

    pub fn table_meta(&self, table_id: TableId) -> Result<Option<TableStats>> {
        let txn = self.storage.begin()?;
        rows::read_meta(txn.as_ref(), table_id)
    }

    pub fn last_ddl_seq(&self, table_id: TableId) -> Result<Option<u64>> {
        let txn = self.storage.begin()?;
        rows::read_ddl_seq(txn.as_ref(), table_id)
    }

    pub fn gc_safe_point_raw(&self) -> Result<Option<String>> {
        let txn = self.storage.begin()?;
        match txn.get(GC_SAFE_POINT_KEY)? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| StatsError::Storage(format!("safe point is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn set_gc_safe_point_raw(&self, value: &str) -> Result<()> {
        self.update("set_gc_safe_point", |txn| {
            txn.set(GC_SAFE_POINT_KEY.to_vec(), value.as_bytes().to_vec())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemStore;
    use crate::types::Datum;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn new_store() -> StatsStore {
        StatsStore::new(Arc::new(MemStore::new()), RetryPolicy::default())
    }

    fn column(table_id: TableId, hist_id: i64, values: &[i64]) -> ColumnStats {
        let buckets = values
            .iter()
            .enumerate()
            .map(|(i, v)| Bucket {
                lower: Datum::Int(*v),
                upper: Datum::Int(*v),
                count: i as i64 + 1,
                repeats: 1,
            })
            .collect();
        ColumnStats {
            key: HistKey::column(table_id, hist_id),
            histogram: Histogram {
                buckets,
                null_count: 0,
                ndv: values.len() as i64,
            },
            correlation: 0.5,
            last_update_version: Timestamp::ZERO,
        }
    }

    #[test]
    fn test_key_order_matches_id_order() {
        assert!(meta_key(-1) < meta_key(0));
        assert!(meta_key(0) < meta_key(1));
        assert!(meta_key(255) < meta_key(256));
        assert_eq!(decode_id(&encode_id(-42)).unwrap(), -42);
        assert_eq!(prefix_end(b"ab"), b"ac".to_vec());
        assert_eq!(prefix_end(&[b'a', 0xff]), b"b".to_vec());
    }

    #[tokio::test]
    async fn test_meta_version_increases() {
        let store = new_store();
        let first = store.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();
        let second = store
            .apply_delta(1, DeltaRecord { delta_count: 2, delta_modify_count: 2 })
            .await
            .unwrap()
            .unwrap();
        assert!(second.version > first.version);
        assert_eq!(second.count, 2);
        assert_eq!(second.modify_count, 2);
    }

    #[tokio::test]
    async fn test_apply_delta_without_meta_is_noop() {
        let store = new_store();
        let written = store
            .apply_delta(9, DeltaRecord { delta_count: 1, delta_modify_count: 1 })
            .await
            .unwrap();
        assert!(written.is_none());
        assert!(store.table_meta(9).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_histogram_roundtrip_and_replace() {
        let store = new_store();
        store.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();
        store.upsert_histogram(&column(1, 1, &[1, 2, 3])).await.unwrap();
        store.upsert_histogram(&column(1, 1, &[7])).await.unwrap();

        let entry = store.read_latest(1).unwrap().unwrap();
        let hist = &entry.column(1).unwrap().histogram;
        assert_eq!(hist.buckets.len(), 1);
        assert_eq!(hist.buckets[0].lower, Datum::Int(7));
        assert_eq!(entry.column(1).unwrap().correlation, 0.5);
    }

    #[tokio::test]
    async fn test_upsert_histogram_requires_meta() {
        let store = new_store();
        let err = store.upsert_histogram(&column(3, 1, &[1])).await.unwrap_err();
        assert!(matches!(err, StatsError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_delete_only_touches_one_table() {
        let store = new_store();
        for table_id in [1, 2] {
            store.upsert_table_meta(TableStats::empty(table_id, Timestamp::ZERO)).await.unwrap();
            store.upsert_histogram(&column(table_id, 1, &[1, 2])).await.unwrap();
        }
        store.delete_table_stats(1).await.unwrap();

        assert!(store.read_latest(1).unwrap().is_none());
        let other = store.read_latest(2).unwrap().unwrap();
        assert_eq!(other.column(1).unwrap().histogram.buckets.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_updated_since() {
        let store = new_store();
        let t1 = store.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();
        let t2 = store.upsert_table_meta(TableStats::empty(2, Timestamp::ZERO)).await.unwrap();

        let all = store.scan_updated_since(Timestamp::ZERO).unwrap();
        assert_eq!(all.iter().map(|m| m.table_id).collect::<Vec<_>>(), vec![1, 2]);

        let newer = store.scan_updated_since(t1.version).unwrap();
        assert_eq!(newer, vec![t2]);
        assert!(store.scan_updated_since(t2.version).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_as_of() {
        let store = new_store();
        let before = store.storage().current_ts();
        store.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();
        let created = store.storage().current_ts();
        store
            .apply_delta(1, DeltaRecord { delta_count: 5, delta_modify_count: 5 })
            .await
            .unwrap();

        assert!(store.read_as_of(before, 1).unwrap().is_none());
        assert_eq!(store.read_as_of(created, 1).unwrap().unwrap().meta.count, 0);
        assert_eq!(store.read_latest(1).unwrap().unwrap().meta.count, 5);
    }

    #[tokio::test]
    async fn test_replace_clears_other_histograms() {
        let store = new_store();
        store.upsert_table_meta(TableStats::empty(1, Timestamp::ZERO)).await.unwrap();
        store.upsert_histogram(&column(1, 1, &[1])).await.unwrap();
        store.upsert_histogram(&column(1, 2, &[1])).await.unwrap();

        let meta = store.replace_table_stats(1, 10, 4, &[column(1, 2, &[5, 6])]).await.unwrap();
        let entry = store.read_latest(1).unwrap().unwrap();
        assert_eq!(entry.meta, meta);
        assert!(entry.column(1).is_none());
        assert_eq!(entry.column(2).unwrap().last_update_version, meta.version);
    }

    #[tokio::test]
    async fn test_update_retries_conflicts() {
        let store = StatsStore::new(
            Arc::new(MemStore::new()),
            RetryPolicy {
                attempts: 3,
                base: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        );
        let calls = AtomicU32::new(0);
        let value = store
            .update("flaky", |_txn| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StatsError::TransientStoreConflict("m".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let err = store
            .update("always", |_txn| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StatsError::TransientStoreConflict("m".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
