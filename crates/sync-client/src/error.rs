//! Client-side sync error taxonomy.
//!
//! Transient network failures are retried with backoff inside [`HttpSyncTransport`]
//! (see `http_transport.rs`) and never reach this enum; what surfaces here is
//! what the sync cycle itself needs to report to a caller or a UI.
//!
//! [`HttpSyncTransport`]: crate::http_transport::HttpSyncTransport

use opsync_core::SyncError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientSyncError>;

#[derive(Debug, Error)]
pub enum ClientSyncError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decryption failed: wrong password or corrupted payload")]
    Decryption,

    #[error("reducer failed to apply operation {op_id}: {source}")]
    Reducer { op_id: String, source: String },

    #[error("a local full-state op conflicts with remote history; user must choose how to resolve")]
    LocalDataConflict,

    #[error("sync cancelled")]
    Cancelled,

    #[error("storage quota exceeded; uploads are halted until freed")]
    StorageQuotaExceeded,

    #[error("another sync cycle is already running on this device")]
    CycleAlreadyInProgress,

    #[error("sync is disabled")]
    SyncDisabled,
}

impl ClientSyncError {
    /// True for errors that should halt uploads but still allow reads/downloads.
    pub fn halts_uploads_only(&self) -> bool {
        matches!(self, Self::StorageQuotaExceeded)
    }
}
