//! Materializes statistics rows for schema changes.
//!
//! Each event carries a per-table sequence number assigned by the schema
//! layer in emission order. The consumer stores the last applied sequence of
//! a table in the same transaction as the event's effect, so a redelivered
//! event is acknowledged without being applied twice.

use crate::cache::StatsCache;
use crate::errors::{Result, StatsError};
use crate::schema::{ColumnInfo, IndexInfo, TableInfo};
use crate::store::{rows, StatsStore};
use crate::types::{ColumnStats, HistKey, TableId, TableStats};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlKind {
    CreateTable(TableInfo),
    AddColumn { table_id: TableId, column: ColumnInfo },
    AddIndex { table_id: TableId, index: IndexInfo },
    DropTable { table_id: TableId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlEvent {
    /// Position of this event among the events of its table, starting at 1.
    pub seq: u64,
    pub kind: DdlKind,
}

impl DdlEvent {
    pub fn new(seq: u64, kind: DdlKind) -> Self {
        Self { seq, kind }
    }

    pub fn table_id(&self) -> TableId {
        match &self.kind {
            DdlKind::CreateTable(info) => info.id,
            DdlKind::AddColumn { table_id, .. } => *table_id,
            DdlKind::AddIndex { table_id, .. } => *table_id,
            DdlKind::DropTable { table_id } => *table_id,
        }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            DdlKind::CreateTable(_) => "create table",
            DdlKind::AddColumn { .. } => "add column",
            DdlKind::AddIndex { .. } => "add index",
            DdlKind::DropTable { .. } => "drop table",
        }
    }
}

/// Lifecycle of one event inside the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Received,
    Applying,
    Applied,
    /// Already applied before; acknowledged without changes.
    Skipped,
    Failed,
}

#[derive(Clone)]
pub struct DdlConsumer {
    store: StatsStore,
    cache: Arc<StatsCache>,
}

impl DdlConsumer {
    pub fn new(store: StatsStore, cache: Arc<StatsCache>) -> Self {
        Self { store, cache }
    }

    /// Applies one event and returns its terminal state. Store failures are
    /// returned as errors; the event itself is never retried by the consumer.
    pub async fn handle(&self, event: &DdlEvent) -> Result<EventState> {
        let table_id = event.table_id();
        let name = event.name();
        let received = EventState::Received;
        debug!("ddl event {} #{} for table {}: {:?}", name, event.seq, table_id, received);

        // Start timestamp of the applying transaction, `None` if already applied.
        let applied = self
            .store
            .update("handle_ddl_event", |txn| {
                if let Some(last) = rows::read_ddl_seq(txn, table_id)? {
                    if event.seq <= last {
                        return Ok(None);
                    }
                }
                let applying = EventState::Applying;
                debug!("ddl event #{} for table {}: {:?}", event.seq, table_id, applying);
                let version = txn.start_ts();
                match &event.kind {
                    DdlKind::CreateTable(info) => {
                        rows::write_meta(txn, &TableStats::empty(info.id, version))?;
                        for column in &info.columns {
                            let key = HistKey::column(info.id, column.id);
                            rows::write_histogram(txn, &ColumnStats::placeholder(key, version))?;
                        }
                        for index in &info.indices {
                            let key = HistKey::index(info.id, index.id);
                            rows::write_histogram(txn, &ColumnStats::placeholder(key, version))?;
                        }
                    }
                    DdlKind::AddColumn { table_id, column } => {
                        if rows::bump_version(txn, *table_id)?.is_none() {
                            return Err(StatsError::schema_mismatch(format!(
                                "column {} added to table {} without statistics",
                                column.name, table_id
                            )));
                        }
                        let key = HistKey::column(*table_id, column.id);
                        rows::write_histogram(txn, &ColumnStats::placeholder(key, version))?;
                    }
                    DdlKind::AddIndex { table_id, index } => {
                        if rows::bump_version(txn, *table_id)?.is_none() {
                            return Err(StatsError::schema_mismatch(format!(
                                "index {} added to table {} without statistics",
                                index.name, table_id
                            )));
                        }
                        let key = HistKey::index(*table_id, index.id);
                        rows::write_histogram(txn, &ColumnStats::placeholder(key, version))?;
                    }
                    DdlKind::DropTable { table_id } => {
                        rows::delete_table(txn, *table_id)?;
                    }
                }
                rows::write_ddl_seq(txn, table_id, event.seq)?;
                Ok(Some(version))
            })
            .await;

        match applied {
            Ok(Some(version)) => {
                if let DdlKind::DropTable { table_id } = event.kind {
                    self.cache.evict(table_id, version);
                }
                let state = EventState::Applied;
                info!("ddl event {} #{} for table {}: {:?}", name, event.seq, table_id, state);
                Ok(EventState::Applied)
            }
            Ok(None) => {
                debug!("ddl event #{} for table {} already applied", event.seq, table_id);
                Ok(EventState::Skipped)
            }
            Err(StatsError::SchemaMismatch(msg)) => {
                warn!("ddl event {} #{} skipped: {}", name, event.seq, msg);
                Ok(EventState::Failed)
            }
            Err(e) => {
                error!(
                    "ddl event {} #{} for table {}: {:?}: {}",
                    name,
                    event.seq,
                    table_id,
                    EventState::Failed,
                    e
                );
                Err(e)
            }
        }
    }

    /// Consumes events until the channel closes or `shutdown` flips. Events
    /// still queued at shutdown are discarded; the next analyze rebuilds
    /// whatever they would have created.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<DdlEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("ddl event loop started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = events.recv() => {
                    let Some(event) = next else {
                        break;
                    };
                    if let Err(e) = self.handle(&event).await {
                        let table_id = event.table_id();
                        warn!("dropping ddl event #{} for table {}: {}", event.seq, table_id, e);
                    }
                }
            }
        }

        events.close();
        let mut discarded = 0;
        while events.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("ddl event loop discarded {} pending events at shutdown", discarded);
        }
        info!("ddl event loop stopped");
    }
}
