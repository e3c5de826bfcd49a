//! Diesel/SQLite-backed implementation of [`opsync_core::OperationLogStore`].
//!
//! Every mutating call funnels through a single-writer actor thread
//! (`db::WriteHandle`) so the vector-clock singleton update required by
//! `append`/`append_batch` always lands in the same transaction as the op
//! insert. Reads go through a pooled connection since SQLite's WAL mode
//! tolerates concurrent readers fine.

pub mod db;
pub mod error;
pub mod model;
pub mod schema;
pub mod store;

pub use db::{create_pool, run_migrations, write_actor, DbConnection, DbPool, WriteHandle};
pub use error::{Result, StorageError};
pub use store::SqliteOperationLogStore;

/// Opens (creating if absent) the database at `path`, runs pending
/// migrations, and spawns the single-writer actor. This is the one-stop
/// constructor most callers want; `create_pool`/`run_migrations`/
/// `write_actor::spawn_writer` remain available individually for callers
/// that need finer control (e.g. tests sharing a pool across fixtures).
pub fn init(path: &str) -> Result<SqliteOperationLogStore> {
    run_migrations(path)?;
    let pool = std::sync::Arc::new(create_pool(path)?);
    let writer = write_actor::spawn_writer((*pool).clone());
    Ok(SqliteOperationLogStore::new(pool, writer))
}
