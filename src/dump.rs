//! JSON statistics document used by dump and load.

use crate::errors::{Result, StatsError};
use crate::schema::TableInfo;
use crate::types::{Bucket, ColumnStats, Datum, HistKey, Histogram, TableEntry, Timestamp};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDocument {
    pub lower: Datum,
    pub upper: Datum,
    pub count: i64,
    pub repeats: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramDocument {
    pub null_count: i64,
    pub ndv: i64,
    pub correlation: f64,
    pub buckets: Vec<BucketDocument>,
}

/// Statistics of one table, keyed by names instead of ids so the document
/// can be loaded into a table with different ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    pub database_name: String,
    pub table_name: String,
    pub count: i64,
    pub modify_count: i64,
    pub version: Timestamp,
    #[serde(default)]
    pub columns: BTreeMap<String, HistogramDocument>,
    #[serde(default)]
    pub indices: BTreeMap<String, HistogramDocument>,
}

impl From<&ColumnStats> for HistogramDocument {
    fn from(stats: &ColumnStats) -> Self {
        Self {
            null_count: stats.histogram.null_count,
            ndv: stats.histogram.ndv,
            correlation: stats.correlation,
            buckets: stats
                .histogram
                .buckets
                .iter()
                .map(|b| BucketDocument {
                    lower: b.lower.clone(),
                    upper: b.upper.clone(),
                    count: b.count,
                    repeats: b.repeats,
                })
                .collect(),
        }
    }
}

impl HistogramDocument {
    fn histogram(&self) -> Histogram {
        Histogram {
            buckets: self
                .buckets
                .iter()
                .map(|b| Bucket {
                    lower: b.lower.clone(),
                    upper: b.upper.clone(),
                    count: b.count,
                    repeats: b.repeats,
                })
                .collect(),
            null_count: self.null_count,
            ndv: self.ndv,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.correlation) {
            return Err(StatsError::encoding(format!(
                "{}: correlation {} outside [-1, 1]",
                what, self.correlation
            )));
        }
        if self.buckets.iter().any(|b| b.lower.is_null() || b.upper.is_null()) {
            return Err(StatsError::encoding(format!("{}: NULL bucket bound", what)));
        }
        self.histogram()
            .validate()
            .map_err(|e| StatsError::encoding(format!("{}: {}", what, e)))
    }

    fn to_column_stats(&self, key: HistKey) -> ColumnStats {
        ColumnStats {
            key,
            histogram: self.histogram(),
            correlation: self.correlation,
            last_update_version: Timestamp::ZERO,
        }
    }
}

impl StatsDocument {
    /// Builds the document of `entry`, naming columns and indices after
    /// `table`. Histograms whose id is unknown to `table` are left out.
    pub fn from_entry(database: &str, table: &TableInfo, entry: &TableEntry) -> Self {
        let mut columns = BTreeMap::new();
        for (id, stats) in &entry.columns {
            match table.column_name(*id) {
                Some(name) => {
                    columns.insert(name.to_string(), HistogramDocument::from(stats));
                }
                None => debug!(
                    "column {} of table {} not in schema, left out of dump",
                    id, table.id
                ),
            }
        }
        let mut indices = BTreeMap::new();
        for (id, stats) in &entry.indices {
            match table.index_name(*id) {
                Some(name) => {
                    indices.insert(name.to_string(), HistogramDocument::from(stats));
                }
                None => debug!(
                    "index {} of table {} not in schema, left out of dump",
                    id, table.id
                ),
            }
        }
        Self {
            database_name: database.to_string(),
            table_name: table.name.clone(),
            count: entry.meta.count,
            modify_count: entry.meta.modify_count,
            version: entry.meta.version,
            columns,
            indices,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| StatsError::encoding(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks that need no schema.
    pub fn validate(&self) -> Result<()> {
        if self.database_name.trim().is_empty() || self.table_name.trim().is_empty() {
            return Err(StatsError::encoding("database and table names must not be empty"));
        }
        if self.count < 0 || self.modify_count < 0 {
            return Err(StatsError::encoding(format!(
                "negative count {} or modify_count {}",
                self.count, self.modify_count
            )));
        }
        for (name, hist) in &self.columns {
            if name.trim().is_empty() {
                return Err(StatsError::encoding("empty column name"));
            }
            hist.validate(&format!("column {}", name))?;
        }
        for (name, hist) in &self.indices {
            if name.trim().is_empty() {
                return Err(StatsError::encoding("empty index name"));
            }
            hist.validate(&format!("index {}", name))?;
        }
        Ok(())
    }

    /// Resolves histograms against the live definition of the table.
    /// Histograms of columns or indices the table no longer has are skipped.
    pub fn column_stats(&self, table: &TableInfo) -> Vec<ColumnStats> {
        let mut out = Vec::with_capacity(self.columns.len() + self.indices.len());
        for (name, hist) in &self.columns {
            match table.column_by_name(name) {
                Some(column) => {
                    out.push(hist.to_column_stats(HistKey::column(table.id, column.id)))
                }
                None => warn!(
                    "table {} has no column '{}', histogram not loaded",
                    table.name, name
                ),
            }
        }
        for (name, hist) in &self.indices {
            match table.index_by_name(name) {
                Some(index) => out.push(hist.to_column_stats(HistKey::index(table.id, index.id))),
                None => warn!(
                    "table {} has no index '{}', histogram not loaded",
                    table.name, name
                ),
            }
        }
        out
    }

    /// Equality on everything but the version.
    pub fn same_stats(&self, other: &StatsDocument) -> bool {
        StatsDocument {
            version: other.version,
            ..self.clone()
        } == *other
    }
}
