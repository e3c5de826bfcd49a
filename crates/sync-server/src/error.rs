//! Server-side sync error taxonomy. Converts from [`opsync_core::SyncError`]
//! via `#[from]`, matching the layering every other crate in this workspace
//! uses.

use opsync_core::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("write actor is no longer running")]
    WriterGone,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
