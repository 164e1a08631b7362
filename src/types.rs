use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type TableId = i64;
pub type HistId = i64;

/// Bits reserved for the logical counter in a [`Timestamp`].
pub const LOGICAL_BITS: u32 = 18;

/// Transactional timestamp: wall-clock milliseconds in the high bits and a
/// logical counter in the low [`LOGICAL_BITS`] bits.
///
/// Doubles as the statistics version, so only ordering is meaningful to
/// callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Timestamp((physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1)))
    }

    pub fn from_millis(physical_ms: i64) -> Self {
        Self::compose(physical_ms.max(0) as u64, 0)
    }

    pub fn physical_ms(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & ((1 << LOGICAL_BITS) - 1)
    }

    /// Moves the timestamp back by `ms` wall-clock milliseconds, saturating at zero.
    pub fn saturating_sub_millis(&self, ms: u64) -> Self {
        Timestamp(self.0.saturating_sub(ms << LOGICAL_BITS))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A histogram bound value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,

            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),

            // Bool < Int < Text
            (Datum::Bool(_), _) => Ordering::Less,
            (_, Datum::Bool(_)) => Ordering::Greater,
            (Datum::Int(_), Datum::Text(_)) => Ordering::Less,
            (Datum::Text(_), Datum::Int(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int(i) => write!(f, "{}", i),
            Datum::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

/// Per-table statistics metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub table_id: TableId,
    /// Row count estimate.
    pub count: i64,
    /// Mutations since the last full analyze.
    pub modify_count: i64,
    pub version: Timestamp,
}

impl TableStats {
    pub fn empty(table_id: TableId, version: Timestamp) -> Self {
        Self {
            table_id,
            count: 0,
            modify_count: 0,
            version,
        }
    }
}

/// One histogram bucket. `count` is cumulative over all preceding buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub lower: Datum,
    pub upper: Datum,
    pub count: i64,
    pub repeats: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
    pub null_count: i64,
    /// Number of distinct non-null values.
    pub ndv: i64,
}

impl Histogram {
    /// Rows covered by the buckets (the last cumulative count).
    pub fn total_count(&self) -> i64 {
        self.buckets.last().map(|b| b.count).unwrap_or(0)
    }

    /// Checks that buckets are ordered, non-overlapping and carry sane counts.
    pub fn validate(&self) -> Result<(), String> {
        if self.null_count < 0 || self.ndv < 0 {
            return Err("negative null_count or ndv".to_string());
        }
        let mut prev: Option<&Bucket> = None;
        for (i, bucket) in self.buckets.iter().enumerate() {
            if bucket.lower > bucket.upper {
                return Err(format!(
                    "bucket {}: lower bound {} exceeds upper bound {}",
                    i, bucket.lower, bucket.upper
                ));
            }
            let prev_count = prev.map(|p| p.count).unwrap_or(0);
            if bucket.count < prev_count {
                return Err(format!(
                    "bucket {}: cumulative count {} decreases from {}",
                    i, bucket.count, prev_count
                ));
            }
            if bucket.repeats < 0 || bucket.repeats > bucket.count - prev_count {
                return Err(format!("bucket {}: repeats {} out of range", i, bucket.repeats));
            }
            if let Some(p) = prev {
                if p.upper >= bucket.lower {
                    return Err(format!(
                        "bucket {}: overlaps previous bucket ({} >= {})",
                        i, p.upper, bucket.lower
                    ));
                }
            }
            prev = Some(bucket);
        }
        Ok(())
    }
}

/// Identifies a column or index histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistKey {
    pub table_id: TableId,
    pub hist_id: HistId,
    pub is_index: bool,
}

impl HistKey {
    pub fn column(table_id: TableId, hist_id: HistId) -> Self {
        Self { table_id, hist_id, is_index: false }
    }

    pub fn index(table_id: TableId, hist_id: HistId) -> Self {
        Self { table_id, hist_id, is_index: true }
    }
}

/// Histogram plus order correlation for one column or index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub key: HistKey,
    pub histogram: Histogram,
    /// Order correlation with row insertion order, in [-1, 1].
    pub correlation: f64,
    pub last_update_version: Timestamp,
}

impl ColumnStats {
    pub fn placeholder(key: HistKey, version: Timestamp) -> Self {
        Self {
            key,
            histogram: Histogram::default(),
            correlation: 0.0,
            last_update_version: version,
        }
    }
}

/// Full statistics of one table as read from the store at one point in time.
///
/// Published to readers behind an `Arc` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub meta: TableStats,
    pub columns: BTreeMap<HistId, ColumnStats>,
    pub indices: BTreeMap<HistId, ColumnStats>,
}

impl TableEntry {
    pub fn new(meta: TableStats) -> Self {
        Self {
            meta,
            columns: BTreeMap::new(),
            indices: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, stats: ColumnStats) {
        if stats.key.is_index {
            self.indices.insert(stats.key.hist_id, stats);
        } else {
            self.columns.insert(stats.key.hist_id, stats);
        }
    }

    pub fn column(&self, hist_id: HistId) -> Option<&ColumnStats> {
        self.columns.get(&hist_id)
    }

    pub fn index(&self, hist_id: HistId) -> Option<&ColumnStats> {
        self.indices.get(&hist_id)
    }

    pub fn version(&self) -> Timestamp {
        self.meta.version
    }
}

/// Pending, not yet persisted row-count changes of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaRecord {
    pub delta_count: i64,
    pub delta_modify_count: i64,
}

impl DeltaRecord {
    pub fn merge(&mut self, other: DeltaRecord) {
        self.delta_count += other.delta_count;
        self.delta_modify_count += other.delta_modify_count;
    }

    pub fn is_zero(&self) -> bool {
        self.delta_count == 0 && self.delta_modify_count == 0
    }
}
