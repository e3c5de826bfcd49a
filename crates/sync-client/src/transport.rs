//! The seam between [`crate::engine::ClientSyncEngine`] and whatever it
//! actually talks to. `opsync-sync-server` (over HTTP, via
//! [`crate::http_transport::HttpSyncTransport`]) and `opsync-file-adapter`
//! both implement this trait, so the engine is written once and backend
//! choice is purely a matter of which transport gets injected.

use async_trait::async_trait;
use opsync_core::wire::{DownloadResponse, UploadResponse};
use opsync_core::{ClientId, Operation};
use std::error::Error as StdError;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn upload(
        &self,
        client_id: &ClientId,
        ops: Vec<Operation>,
    ) -> Result<UploadResponse, Self::Error>;

    async fn download(
        &self,
        since_seq: i64,
        limit: u32,
    ) -> Result<DownloadResponse, Self::Error>;

    async fn user_sync_state(&self) -> Result<i64, Self::Error>;
}
