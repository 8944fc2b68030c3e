//! Database layer for geomesh.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the record store that the real-time core
//! uses as its durable-storage collaborator.
//!
//! The in-memory registries stay authoritative at runtime; this crate only
//! receives best-effort durability writes, applied in order by a
//! [`RecordWriter`], and serves restores at startup and
//! record lookups for the RPC business handlers.

mod migrations;
mod pool;
mod store;
mod writer;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, open_migrated_pool, DbPool, DbRuntimeSettings, PoolError};
pub use store::{Filter, Record, RecordStore, SqliteRecordStore, StoreError};
pub use writer::RecordWriter;
