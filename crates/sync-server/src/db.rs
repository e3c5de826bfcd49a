//! Per-user connection pool, migration runner, and single-writer actor.
//!
//! Mirrors `opsync-storage-sqlite::db` one for one (same single-writer
//! rationale: SQLite allows one writer at a time), but scoped to a
//! per-user database file under a shared base directory rather than one
//! fixed path, since the server is the authority for every account at once.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::oneshot;

use crate::error::{Result, ServerError};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Maps an opaque `user_id` onto a filesystem-safe database file name.
/// Rejects ids that would escape `base_dir` or collide after sanitization.
pub fn user_db_path(base_dir: &Path, user_id: &str) -> Result<PathBuf> {
    if user_id.is_empty()
        || user_id.contains('/')
        || user_id.contains('\\')
        || user_id == "."
        || user_id == ".."
    {
        return Err(ServerError::InvalidUserId(user_id.to_string()));
    }
    Ok(base_dir.join(format!("{user_id}.sqlite3")))
}

pub fn create_pool(path: &Path) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| ServerError::Migration(e.to_string()))?;

    let mut conn = pool.get().map_err(ServerError::Pool)?;
    conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        .map_err(ServerError::Database)?;

    Ok(pool)
}

pub fn run_migrations(path: &Path) -> Result<()> {
    use diesel::Connection;
    let mut conn = SqliteConnection::establish(&path.to_string_lossy())
        .map_err(|e| ServerError::Migration(e.to_string()))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| ServerError::Migration(e.to_string()))?;
    Ok(())
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    pool.get().map_err(ServerError::Pool)
}

type WriteJob = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    sender: std_mpsc::Sender<WriteJob>,
}

impl WriteHandle {
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let wrapped: WriteJob = Box::new(move |conn| {
            let result = job(conn);
            let _ = tx.send(result);
        });
        self.sender
            .send(wrapped)
            .map_err(|_| ServerError::WriterGone)?;
        rx.await.map_err(|_| ServerError::WriterGone)?
    }
}

pub mod write_actor {
    use super::*;

    pub fn spawn_writer(pool: DbPool, thread_name: String) -> WriteHandle {
        let (sender, receiver) = std_mpsc::channel::<WriteJob>();

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut conn = match pool.get() {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("sync-server write actor failed to acquire connection: {err}");
                        return;
                    }
                };
                while let Ok(job) = receiver.recv() {
                    job(&mut conn);
                }
            })
            .expect("failed to spawn sqlite write actor thread");

        WriteHandle { sender }
    }
}
