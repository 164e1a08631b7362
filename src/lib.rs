pub mod analyze;
pub mod cache;
pub mod config;
pub mod ddl;
pub mod delta;
pub mod dump;
pub mod errors;
pub mod flusher;
pub mod handle;
pub mod kv;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod types;
pub mod web;

pub use cache::StatsCache;
pub use config::Config;
pub use ddl::{DdlEvent, DdlKind, EventState};
pub use delta::DeltaTracker;
pub use dump::StatsDocument;
pub use errors::{Result, StatsError};
pub use handle::{BackgroundTasks, StatsHandle};
pub use kv::{MemStore, Storage, Transaction};
pub use schema::{InfoSchema, MemorySchema, SchemaProvider};
pub use store::StatsStore;
pub use types::{ColumnStats, Datum, HistKey, Histogram, TableEntry, TableStats, Timestamp};
pub use web::start_server;
