//! Connection pool, migration runner, and the single-writer actor that every
//! mutating call in this crate funnels through.
//!
//! SQLite allows only one writer at a time; rather than contend on a mutex
//! around the pool, all writes are serialized onto one dedicated OS thread
//! holding a single connection, and callers submit closures to it over a
//! channel. Reads go through the pool directly since SQLite handles
//! concurrent readers fine in WAL mode.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::oneshot;

use crate::error::{Result, StorageError};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Opens (creating if absent) the SQLite database at `path` and builds a
/// pooled-reader connection manager. WAL mode is enabled so readers never
/// block behind the single writer.
pub fn create_pool(path: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(path);
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    let mut conn = pool.get().map_err(StorageError::Pool)?;
    conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        .map_err(StorageError::Database)?;

    Ok(pool)
}

/// Runs all embedded migrations against the database at `path`. Never
/// destructively rewrites existing data: every migration is a forward-only,
/// additive step.
pub fn run_migrations(path: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish_for_migrations(path)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(())
}

/// Small extension so `run_migrations` doesn't need diesel's `Connection`
/// trait import juggling at the call site.
trait EstablishForMigrations: Sized {
    fn establish_for_migrations(path: &str) -> Result<Self>;
}

impl EstablishForMigrations for SqliteConnection {
    fn establish_for_migrations(path: &str) -> Result<Self> {
        use diesel::Connection;
        SqliteConnection::establish(path).map_err(|e| StorageError::Migration(e.to_string()))
    }
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    pool.get().map_err(StorageError::Pool)
}

type WriteJob = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

/// A handle to the single-writer actor thread. Cloning is cheap (it's just a
/// channel sender); every clone feeds the same underlying writer connection.
#[derive(Clone)]
pub struct WriteHandle {
    sender: std_mpsc::Sender<WriteJob>,
}

impl WriteHandle {
    /// Runs `job` on the writer thread and returns its result. `job` must be
    /// `Send` but is otherwise free to do whatever diesel calls it needs;
    /// the whole point of the actor is that only one such closure ever runs
    /// at a time against the database.
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
            .map_err(|_| StorageError::WriterGone)?;
        rx.await.map_err(|_| StorageError::WriterGone)?
    }
}

pub mod write_actor {
    use super::*;

    /// Spawns the writer thread and returns a [`WriteHandle`] for submitting
    /// work to it. The thread owns exactly one connection for the lifetime
    /// of the process (or until the handle and all its clones are dropped).
    pub fn spawn_writer(pool: DbPool) -> WriteHandle {
        let (sender, receiver) = std_mpsc::channel::<WriteJob>();

        thread::Builder::new()
            .name("opsync-sqlite-writer".into())
            .spawn(move || {
                let mut conn = match pool.get() {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("sync write actor failed to acquire connection: {err}");
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
