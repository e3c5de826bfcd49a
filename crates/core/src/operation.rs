//! The append-only log's unit of record: an [`Operation`] and the
//! client/server envelopes built around it.

use crate::client_id::ClientId;
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

/// The kind of change an [`Operation`] carries.
///
/// `SYNC_IMPORT`, `BACKUP_IMPORT`, and `REPAIR` are the "full-state" kinds:
/// each one supersedes everything authored before it for its client, and is
/// the anchor the sync import filter compares incoming ops against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Crt,
    Upd,
    Del,
    Lww,
    Batch,
    SyncImport,
    BackupImport,
    Repair,
}

impl OpType {
    pub fn is_full_state(self) -> bool {
        matches!(
            self,
            OpType::SyncImport | OpType::BackupImport | OpType::Repair
        )
    }
}

/// Bulk pseudo-entities that have no single owning entity id.
pub const ENTITY_TYPE_ALL: &str = "ALL";
pub const ENTITY_TYPE_RECOVERY: &str = "RECOVERY";
/// Carried over from server-migration scenarios; excluded from
/// [`crate::reducer`]-visible "has this account ever synced" checks.
pub const ENTITY_TYPE_MIGRATION: &str = "MIGRATION";

/// Why a full-state op was authored. Server rule: exactly one `Initial`
/// `SyncImport` is ever accepted per user account; `Recovery` is always
/// allowed (password rotation, explicit backup restore, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportReason {
    Initial,
    Recovery,
}

/// A single authored change. Immutable once created: later bookkeeping
/// (`syncedAt`, `applicationStatus`, ...) lives on the wrapper types that
/// embed an `Operation`, never on the operation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Time-sortable, lexicographically ordered by authoring instant
    /// (UUIDv7 in practice).
    pub id: String,
    pub client_id: ClientId,
    pub op_type: OpType,
    pub entity_type: String,
    /// `None` for the bulk `ALL`/`RECOVERY` entity types.
    pub entity_id: Option<String>,
    /// Opaque to this crate: ciphertext when encryption is enabled,
    /// otherwise an application-defined JSON value.
    pub payload: serde_json::Value,
    pub vector_clock: VectorClock,
    /// Wall-clock milliseconds at authoring. Used only for LWW tie-breaking,
    /// never for causal ordering.
    pub timestamp_ms: i64,
    pub schema_version: u32,
    /// Present only on full-state ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ImportReason>,
}

impl Operation {
    pub fn is_bulk_entity(&self) -> bool {
        self.entity_type == ENTITY_TYPE_ALL || self.entity_type == ENTITY_TYPE_RECOVERY
    }
}

/// Where a log entry came from: authored on this device, or received from
/// the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpSource {
    Local,
    Remote,
}

/// Client-side application status of a log entry, tracked so crash recovery
/// and retries know what still needs doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    Failed,
}

/// A durable row in the client's operation log: an [`Operation`] plus
/// client-local bookkeeping. `seq` is assigned by the store on append and is
/// never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    pub seq: i64,
    pub operation: Operation,
    pub source: OpSource,
    /// Wall-clock ms when this entry was appended to the local log.
    pub applied_at: i64,
    pub synced_at: Option<i64>,
    pub rejected_at: Option<i64>,
    pub application_status: ApplicationStatus,
    pub retry_count: u32,
}

/// The server's durable record of an accepted op: the client [`Operation`]
/// plus the server-assigned receipt metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOperation {
    pub server_seq: i64,
    pub user_id: String,
    pub operation: Operation,
    pub received_at: i64,
}

/// A compacted reducer state, used to bound log replay cost. Replaying every
/// entry with `seq > last_applied_op_seq` onto `state` must reproduce the
/// live state exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: serde_json::Value,
    pub last_applied_op_seq: i64,
    pub vector_clock: VectorClock,
    pub compacted_at: i64,
    pub schema_version: u32,
    pub compaction_counter: u64,
    pub entity_keys: Vec<String>,
}

/// A snapshot captured immediately before an import-style operation runs, so
/// the user can manually recover if the import was a mistake. Keyed
/// singleton: at most one exists at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBackup {
    pub snapshot: StateSnapshot,
    pub saved_at: i64,
}

/// The server's per-user bookkeeping record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncState {
    pub user_id: String,
    pub max_server_seq: i64,
    pub session_id: String,
    pub storage_quota_used_bytes: i64,
}
