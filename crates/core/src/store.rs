//! The storage contract a `ClientSyncEngine` is generic over. Defined here
//! (not in `opsync-storage-sqlite`) so the sync-client crate can be generic
//! over storage backends without depending on Diesel/SQLite directly.

use crate::operation::{OperationLogEntry, StateSnapshot};
use crate::operation::{OpSource, Operation};
use crate::vector_clock::VectorClock;
use async_trait::async_trait;
use std::error::Error as StdError;

/// Durable append-only log of operations, plus the caches and side tables a
/// client sync engine needs: the vector-clock singleton, the compaction
/// snapshot (with a crash-safety backup copy), the import backup, and a
/// persistent compaction counter.
///
/// Implementations MUST uphold:
/// - `append`/`append_batch` update the vector-clock singleton in the same
///   transaction as the op insert when `source` is `Local`.
/// - `get_unsynced` is incremental: implementations may cache the
///   last-scanned seq and only scan the tail on repeat calls.
/// - `mark_rejected` tombstones rather than deletes.
/// - `merge_remote_op_clocks` is mandatory after applying any remote batch;
///   skipping it silently breaks causality tracking.
#[async_trait]
pub trait OperationLogStore: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn append(
        &self,
        op: Operation,
        source: OpSource,
    ) -> Result<OperationLogEntry, Self::Error>;

    async fn append_batch(
        &self,
        ops: Vec<Operation>,
        source: OpSource,
    ) -> Result<Vec<OperationLogEntry>, Self::Error>;

    async fn get_ops_after_seq(&self, seq: i64) -> Result<Vec<OperationLogEntry>, Self::Error>;

    async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, Self::Error>;

    async fn mark_synced(&self, seqs: &[i64]) -> Result<(), Self::Error>;
    async fn mark_rejected(&self, op_ids: &[String]) -> Result<(), Self::Error>;
    async fn mark_applied(&self, seqs: &[i64]) -> Result<(), Self::Error>;
    async fn mark_failed(
        &self,
        op_ids: &[String],
        max_retries: Option<u32>,
    ) -> Result<(), Self::Error>;

    /// Scans in reverse seq order for the full-state op (`SYNC_IMPORT` /
    /// `BACKUP_IMPORT` / `REPAIR`) with the lexicographically greatest id.
    async fn get_latest_full_state_op(&self) -> Result<Option<Operation>, Self::Error>;
    async fn clear_full_state_ops(&self) -> Result<(), Self::Error>;

    /// True iff any op has `syncedAt` set and an entity type outside
    /// `{MIGRATION, RECOVERY}`.
    async fn has_synced_ops(&self) -> Result<bool, Self::Error>;

    async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, Self::Error>;
    async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, Self::Error>;

    /// Membership test against the applied-op-id cache, used by the sync
    /// engine to deduplicate a downloaded batch before applying it.
    async fn is_applied(&self, op_id: &str) -> Result<bool, Self::Error>;

    async fn save_state_cache(&self, snapshot: StateSnapshot) -> Result<(), Self::Error>;
    async fn load_state_cache(&self) -> Result<Option<StateSnapshot>, Self::Error>;
    async fn save_state_cache_backup(&self) -> Result<(), Self::Error>;
    async fn restore_state_cache_from_backup(
        &self,
    ) -> Result<Option<StateSnapshot>, Self::Error>;

    async fn get_vector_clock(&self) -> Result<VectorClock, Self::Error>;
    async fn set_vector_clock(&self, vector_clock: VectorClock) -> Result<(), Self::Error>;
    /// Merges every op's vector clock in `ops` into the local singleton.
    /// Returns the merged clock.
    async fn merge_remote_op_clocks(
        &self,
        ops: &[Operation],
    ) -> Result<VectorClock, Self::Error>;
    /// Invalidates any in-memory copy of the vector clock so the next read
    /// goes to durable storage. Needed for multi-tab/multi-process safety.
    async fn clear_vector_clock_cache(&self);

    async fn increment_compaction_counter(&self) -> Result<u64, Self::Error>;
    async fn reset_compaction_counter(&self) -> Result<(), Self::Error>;
}
