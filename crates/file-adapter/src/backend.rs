//! The storage seam underneath [`crate::FileAdapterTransport`]: reading and
//! compare-and-swap-writing the single JSON document (§4.8), independent of
//! whether it lives on local disk or a WebDAV share.

use async_trait::async_trait;

use crate::error::Result;

/// A backend that stores exactly one opaque blob. CAS is content-based
/// rather than version-tagged: a write only succeeds if the stored bytes
/// still match what the caller last read, so both backends can implement it
/// without a server-side version counter of their own.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// `None` if nothing has been written yet.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Writes `new_bytes` iff the currently stored content equals
    /// `expected_bytes` (`None` meaning "must not exist yet"). Returns
    /// `Ok(true)` on success, `Ok(false)` on a CAS mismatch so the caller
    /// can re-read and retry.
    async fn compare_and_write(
        &self,
        expected_bytes: Option<&[u8]>,
        new_bytes: Vec<u8>,
    ) -> Result<bool>;
}

pub mod local;
pub mod webdav;

pub use local::LocalFileBackend;
pub use webdav::WebdavFileBackend;
