use crate::types::{TableId, Timestamp};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    // Store errors
    #[error("transaction conflict on key {0}")]
    TransientStoreConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("flush failed for tables {table_ids:?}, deltas re-queued")]
    FlushFailed { table_ids: Vec<TableId> },

    // Historical reads
    #[error("snapshot {requested} predates the GC safe point {safe_point}")]
    SafePointViolation { requested: String, safe_point: String },

    #[error("snapshot {requested} is older than the store GC watermark {watermark}")]
    SnapshotTooOld { requested: Timestamp, watermark: Timestamp },

    #[error("invalid snapshot time: {0}")]
    InvalidSnapshot(String),

    // Schema and documents
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("invalid stats document: {0}")]
    EncodingError(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Wrapped errors
    #[error("row encoding error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StatsError>;

impl StatsError {
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        StatsError::SchemaMismatch(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        StatsError::EncodingError(msg.into())
    }

    pub fn table_not_found(db: &str, table: &str) -> Self {
        StatsError::TableNotFound(format!("{}.{}", db, table))
    }

    /// Conflicts are the only errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StatsError::TransientStoreConflict(_))
    }
}
