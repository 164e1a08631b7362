//! Live schema seen by the statistics subsystem.
//!
//! [`InfoSchema`] is an immutable, versioned catalog snapshot. The schema
//! layer publishes a new one on every change; [`MemorySchema`] is an
//! in-process schema layer that keeps every published snapshot with the
//! timestamp it took effect at, so historical dumps can resolve a table name
//! as of a past moment, and emits the matching [`DdlEvent`]s.

use crate::ddl::{DdlEvent, DdlKind};
use crate::errors::{Result, StatsError};
use crate::kv::Storage;
use crate::types::{HistId, TableId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: HistId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: HistId,
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
}

impl TableInfo {
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexInfo> {
        self.indices.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn column_name(&self, id: HistId) -> Option<&str> {
        self.columns.iter().find(|c| c.id == id).map(|c| c.name.as_str())
    }

    pub fn index_name(&self, id: HistId) -> Option<&str> {
        self.indices.iter().find(|i| i.id == id).map(|i| i.name.as_str())
    }
}

/// One immutable version of the catalog.
#[derive(Debug, Clone, Default)]
pub struct InfoSchema {
    pub version: i64,
    databases: BTreeMap<String, BTreeMap<String, Arc<TableInfo>>>,
    by_id: HashMap<TableId, (String, Arc<TableInfo>)>,
}

impl InfoSchema {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn has_database(&self, db: &str) -> bool {
        self.databases.contains_key(&db.to_lowercase())
    }

    pub fn table_by_name(&self, db: &str, table: &str) -> Option<Arc<TableInfo>> {
        self.databases
            .get(&db.to_lowercase())
            .and_then(|tables| tables.get(&table.to_lowercase()))
            .cloned()
    }

    pub fn table_by_id(&self, table_id: TableId) -> Option<Arc<TableInfo>> {
        self.by_id.get(&table_id).map(|(_, t)| t.clone())
    }

    pub fn database_of(&self, table_id: TableId) -> Option<&str> {
        self.by_id.get(&table_id).map(|(db, _)| db.as_str())
    }

    pub fn contains(&self, table_id: TableId) -> bool {
        self.by_id.contains_key(&table_id)
    }

    pub fn table_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.by_id.keys().copied()
    }

    pub fn add_database(&mut self, db: &str) {
        self.databases.entry(db.to_lowercase()).or_default();
    }

    pub fn put_table(&mut self, db: &str, table: TableInfo) -> Result<()> {
        let db = db.to_lowercase();
        let tables = self
            .databases
            .get_mut(&db)
            .ok_or_else(|| StatsError::schema_mismatch(format!("unknown database '{}'", db)))?;
        let table = Arc::new(table);
        if let Some(old) = tables.insert(table.name.to_lowercase(), table.clone()) {
            if old.id != table.id {
                self.by_id.remove(&old.id);
            }
        }
        self.by_id.insert(table.id, (db, table));
        Ok(())
    }

    pub fn remove_table(&mut self, db: &str, table: &str) -> Option<Arc<TableInfo>> {
        let removed = self
            .databases
            .get_mut(&db.to_lowercase())
            .and_then(|tables| tables.remove(&table.to_lowercase()))?;
        self.by_id.remove(&removed.id);
        Some(removed)
    }
}

pub trait SchemaProvider: Send + Sync {
    fn current(&self) -> Arc<InfoSchema>;

    /// The schema that was in effect at `ts`, if any existed yet.
    fn as_of(&self, ts: Timestamp) -> Option<Arc<InfoSchema>>;
}

#[derive(Default)]
struct SchemaHistory {
    versions: Vec<(Timestamp, Arc<InfoSchema>)>,
    next_table_id: TableId,
    ddl_seqs: HashMap<TableId, u64>,
}

impl SchemaHistory {
    fn latest(&self) -> Arc<InfoSchema> {
        self.versions
            .last()
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }

    fn next_seq(&mut self, table_id: TableId) -> u64 {
        let seq = self.ddl_seqs.entry(table_id).or_insert(0);
        *seq += 1;
        *seq
    }
}

/// In-process schema layer. Timestamps come from the KV store's oracle so
/// schema history and statistics versions share one clock.
pub struct MemorySchema {
    storage: Arc<dyn Storage>,
    state: RwLock<SchemaHistory>,
}

impl MemorySchema {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            state: RwLock::new(SchemaHistory {
                next_table_id: 100,
                ..Default::default()
            }),
        }
    }

    /// Applies `change` to a copy of the latest schema and publishes it.
    fn publish<T>(
        &self,
        change: impl FnOnce(&mut InfoSchema, &mut SchemaHistory) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.write();
        let mut next = (*state.latest()).clone();
        let out = change(&mut next, &mut *state)?;
        next.version += 1;
        let ts = self.storage.current_ts();
        state.versions.push((ts, Arc::new(next)));
        Ok(out)
    }

    pub fn create_database(&self, db: &str) -> Result<()> {
        self.publish(|schema, _| {
            schema.add_database(db);
            Ok(())
        })
    }

    pub fn create_table(&self, db: &str, table: &str, columns: &[&str]) -> Result<DdlEvent> {
        self.publish(|schema, state| {
            if schema.table_by_name(db, table).is_some() {
                let msg = format!("table {}.{} already exists", db, table);
                return Err(StatsError::schema_mismatch(msg));
            }
            let id = state.next_table_id;
            state.next_table_id += 1;
            let info = TableInfo {
                id,
                name: table.to_string(),
                columns: columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| ColumnInfo {
                        id: i as HistId + 1,
                        name: name.to_string(),
                    })
                    .collect(),
                indices: Vec::new(),
            };
            schema.put_table(db, info.clone())?;
            Ok(DdlEvent::new(state.next_seq(id), DdlKind::CreateTable(info)))
        })
    }

    pub fn add_column(&self, db: &str, table: &str, column: &str) -> Result<DdlEvent> {
        self.publish(|schema, state| {
            let mut info = (*schema
                .table_by_name(db, table)
                .ok_or_else(|| StatsError::table_not_found(db, table))?)
            .clone();
            let col = ColumnInfo {
                id: info.columns.iter().map(|c| c.id).max().unwrap_or(0) + 1,
                name: column.to_string(),
            };
            info.columns.push(col.clone());
            let table_id = info.id;
            schema.put_table(db, info)?;
            let kind = DdlKind::AddColumn { table_id, column: col };
            Ok(DdlEvent::new(state.next_seq(table_id), kind))
        })
    }

    pub fn add_index(
        &self,
        db: &str,
        table: &str,
        index: &str,
        columns: &[&str],
    ) -> Result<DdlEvent> {
        self.publish(|schema, state| {
            let mut info = (*schema
                .table_by_name(db, table)
                .ok_or_else(|| StatsError::table_not_found(db, table))?)
            .clone();
            if let Some(missing) = columns.iter().find(|c| info.column_by_name(c).is_none()) {
                let msg = format!("index column '{}' not in {}", missing, table);
                return Err(StatsError::schema_mismatch(msg));
            }
            let idx = IndexInfo {
                id: info.indices.iter().map(|i| i.id).max().unwrap_or(0) + 1,
                name: index.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
            };
            info.indices.push(idx.clone());
            let table_id = info.id;
            schema.put_table(db, info)?;
            Ok(DdlEvent::new(state.next_seq(table_id), DdlKind::AddIndex { table_id, index: idx }))
        })
    }

    pub fn drop_table(&self, db: &str, table: &str) -> Result<DdlEvent> {
        self.publish(|schema, state| {
            let removed = schema
                .remove_table(db, table)
                .ok_or_else(|| StatsError::table_not_found(db, table))?;
            let kind = DdlKind::DropTable { table_id: removed.id };
            Ok(DdlEvent::new(state.next_seq(removed.id), kind))
        })
    }
}

impl SchemaProvider for MemorySchema {
    fn current(&self) -> Arc<InfoSchema> {
        self.state.read().latest()
    }

    fn as_of(&self, ts: Timestamp) -> Option<Arc<InfoSchema>> {
        let state = self.state.read();
        let idx = state.versions.partition_point(|(applied, _)| *applied <= ts);
        idx.checked_sub(1).map(|i| state.versions[i].1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemStore;

    fn new_schema() -> (MemorySchema, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemStore::new());
        (MemorySchema::new(storage.clone()), storage)
    }

    #[test]
    fn test_create_table_and_index() {
        let (schema, _) = new_schema();
        schema.create_database("tidb").unwrap();
        let created = schema.create_table("tidb", "test", &["a", "b"]).unwrap();
        let indexed = schema.add_index("tidb", "test", "c", &["a", "b"]).unwrap();

        assert_eq!(created.seq, 1);
        assert_eq!(indexed.seq, 2);
        let info = schema.current().table_by_name("tidb", "TEST").unwrap();
        assert_eq!(info.column_by_name("a").unwrap().id, 1);
        assert_eq!(info.index_by_name("c").unwrap().id, 1);
        assert_eq!(schema.current().version, 3);
    }

    #[test]
    fn test_unknown_objects() {
        let (schema, _) = new_schema();
        assert!(schema.create_table("nodb", "t", &["a"]).is_err());
        schema.create_database("db").unwrap();
        schema.create_table("db", "t", &["a"]).unwrap();
        assert!(schema.create_table("db", "t", &["a"]).is_err());
        assert!(schema.add_index("db", "t", "i", &["zzz"]).is_err());
        assert!(schema.drop_table("db", "missing").is_err());
    }

    #[test]
    fn test_history_resolves_recreated_table() {
        let (schema, storage) = new_schema();
        let before_anything = storage.current_ts();
        schema.create_database("db").unwrap();
        schema.create_table("db", "t", &["a"]).unwrap();
        let old_id = schema.current().table_by_name("db", "t").unwrap().id;
        let between = storage.current_ts();

        schema.drop_table("db", "t").unwrap();
        schema.create_table("db", "t", &["a"]).unwrap();
        let new_id = schema.current().table_by_name("db", "t").unwrap().id;
        assert_ne!(old_id, new_id);

        assert!(schema.as_of(before_anything).is_none());
        let then = schema.as_of(between).unwrap();
        assert_eq!(then.table_by_name("db", "t").unwrap().id, old_id);
        assert!(!schema.current().contains(old_id));
    }
}
