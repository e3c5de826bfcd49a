//! Request/response shapes shared by `apps/server` and `sync-client` across
//! the wire protocol boundary. All structs are `camelCase` on the wire,
//! matching every other serde-facing type in this crate.

use crate::client_id::ClientId;
use crate::operation::{Operation, StoredOperation};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

/// A batch of locally authored operations offered to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub client_id: ClientId,
    pub ops: Vec<Operation>,
}

/// The server's verdict on a single uploaded op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub op_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<WireErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub results: Vec<UploadResult>,
}

/// Error codes surfaced on the wire. Kept as a closed enum (not a free-form
/// string) so both ends of the protocol agree on the exhaustive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    ConflictConcurrent,
    ConflictSuperseded,
    EqualDifferentClient,
    SyncImportExists,
    StorageQuotaExceeded,
    Auth,
    Unavailable,
}

/// Request to page through server history starting after `since_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub since_seq: i64,
    pub limit: u32,
}

/// The server's default and hard cap for a single download page.
pub const DOWNLOAD_PAGE_LIMIT: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub ops: Vec<StoredOperation>,
    pub max_server_seq: i64,
}

/// Response to a user-sync-state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncStateResponse {
    pub max_server_seq: i64,
}

/// The single JSON document written by the WebDAV-style file adapter (§4.8,
/// §6). `sync_version` increments on every write and doubles as a
/// compare-and-swap token for optimistic concurrency against the remote
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAdapterDocument {
    pub state: serde_json::Value,
    pub recent_ops: Vec<Operation>,
    pub vector_clock: VectorClock,
    pub sync_version: u64,
}

/// Cap on `recentOps` retained in a [`FileAdapterDocument`] (§4.8: "N=200").
pub const FILE_ADAPTER_RECENT_OPS_CAP: usize = 200;
