//! The WebDAV-style, single-JSON-document sync backend (§4.8/§6): an
//! alternative to `apps/server` for accounts with no server process of
//! their own, implementing the same [`opsync_sync_client::SyncTransport`]
//! seam `HttpSyncTransport` does.

pub mod backend;
pub mod error;
pub mod transport;

pub use backend::{FileBackend, LocalFileBackend, WebdavFileBackend};
pub use error::{FileAdapterError, Result};
pub use transport::FileAdapterTransport;
