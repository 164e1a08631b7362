//! Maps wall-clock snapshot times to store timestamps, guarded by the GC
//! safe point.

use crate::errors::{Result, StatsError};
use crate::store::StatsStore;
use crate::types::Timestamp;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use log::debug;

/// Format of snapshot arguments, interpreted in local time.
pub const SNAPSHOT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Format of the persisted GC safe point.
pub const SAFE_POINT_FORMAT: &str = "%Y%m%d-%H:%M:%S %z";

pub fn parse_snapshot(snapshot: &str) -> Result<DateTime<Local>> {
    if snapshot.len() != 14 || !snapshot.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StatsError::InvalidSnapshot(format!("'{}' is not YYYYMMDDhhmmss", snapshot)));
    }
    let naive = NaiveDateTime::parse_from_str(snapshot, SNAPSHOT_FORMAT)
        .map_err(|e| StatsError::InvalidSnapshot(format!("'{}': {}", snapshot, e)))?;
    // A repeated wall-clock hour resolves to its first occurrence.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| {
            StatsError::InvalidSnapshot(format!("'{}' does not exist in local time", snapshot))
        })
}

pub fn format_snapshot<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(SNAPSHOT_FORMAT).to_string()
}

pub fn format_safe_point<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(SAFE_POINT_FORMAT).to_string()
}

pub fn parse_safe_point(raw: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw.trim(), SAFE_POINT_FORMAT)
        .map_err(|e| StatsError::Storage(format!("malformed GC safe point '{}': {}", raw, e)))
}

/// Store timestamp of the instant `at`, with a zero logical part.
pub fn timestamp_of<Tz: TimeZone>(at: &DateTime<Tz>) -> Timestamp {
    Timestamp::from_millis(at.timestamp_millis())
}

#[derive(Clone)]
pub struct SnapshotResolver {
    store: StatsStore,
}

impl SnapshotResolver {
    pub fn new(store: StatsStore) -> Self {
        Self { store }
    }

    /// The persisted GC safe point, `None` if no GC has run yet.
    pub fn safe_point(&self) -> Result<Option<DateTime<FixedOffset>>> {
        self.store
            .gc_safe_point_raw()?
            .map(|raw| parse_safe_point(&raw))
            .transpose()
    }

    pub async fn set_safe_point<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> Result<()>
    where
        Tz::Offset: std::fmt::Display,
    {
        self.store.set_gc_safe_point_raw(&format_safe_point(at)).await
    }

    /// Timestamp to read a snapshot of `at` with. Times in the future
    /// resolve to the current timestamp.
    pub fn resolve<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> Result<Timestamp>
    where
        Tz::Offset: std::fmt::Display,
    {
        if let Some(safe_point) = self.safe_point()? {
            if at.timestamp_millis() < safe_point.timestamp_millis() {
                return Err(StatsError::SafePointViolation {
                    requested: format_snapshot(at),
                    safe_point: format_safe_point(&safe_point),
                });
            }
        }
        let ts = timestamp_of(at).min(self.store.storage().current_ts());
        debug!("snapshot {} resolved to {}", format_snapshot(at), ts);
        Ok(ts)
    }
}
