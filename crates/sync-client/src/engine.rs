//! The client sync cycle state machine (§4.5): download-first, apply,
//! detect local-data conflict, upload, settle.

use crate::conflict::{ConflictChoice, ConflictResolver, LocalDataConflict};
use crate::config::SyncConfig;
use crate::crypto::{self, EncryptionEnvelope};
use crate::error::{ClientSyncError, Result};
use crate::reducer::ReducerSink;
use crate::transport::SyncTransport;
use opsync_core::operation::ENTITY_TYPE_ALL;
use opsync_core::wire::DOWNLOAD_PAGE_LIMIT;
use opsync_core::{
    ClientId, ImportReason, OpSource, OpType, Operation, OperationLogEntry, OperationLogStore,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A sync cycle loops at most this many times chasing LWW recovery ops
/// before giving up, per the "bounded retry counter prevents livelock" rule.
const MAX_CYCLE_LOOPS: u32 = 5;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub downloaded: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub recovered: usize,
    pub cycles: u32,
}

/// Result of the crash-recovery pass the store contract requires at startup
/// (§4.3): re-applied `pending` ops, retried `failed` ops, and whether an
/// interrupted migration's state-cache backup was restored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub pending_reapplied: usize,
    pub failed_retried: usize,
    pub state_cache_restored: bool,
}

enum DownloadOutcome {
    Applied(usize),
    Conflict(Vec<Operation>),
}

#[derive(Default)]
struct UploadOutcome {
    accepted: usize,
    rejected: usize,
    recovered: usize,
}

fn storage_err<E: std::error::Error>(err: E) -> ClientSyncError {
    ClientSyncError::Storage(err.to_string())
}

fn transport_err<E: std::error::Error>(err: E) -> ClientSyncError {
    ClientSyncError::Transport(err.to_string())
}

/// Orchestrates sync cycles for one device. Generic over the durable log
/// (`S`) and the wire transport (`T`) so `opsync-storage-sqlite` +
/// `opsync-sync-server` (over HTTP) and `opsync-file-adapter` are
/// interchangeable without the engine itself changing.
pub struct ClientSyncEngine<S, T>
where
    S: OperationLogStore,
    T: SyncTransport,
{
    client_id: ClientId,
    store: Arc<S>,
    transport: Arc<T>,
    reducer: Arc<dyn ReducerSink>,
    conflict_resolver: Arc<dyn ConflictResolver>,
    config: RwLock<SyncConfig>,
    configured: AtomicBool,
    enabled: AtomicBool,
    cycle_lock: tokio::sync::Mutex<()>,
    last_known_server_seq: AtomicI64,
}

impl<S, T> ClientSyncEngine<S, T>
where
    S: OperationLogStore,
    T: SyncTransport,
{
    pub fn new(
        client_id: ClientId,
        store: Arc<S>,
        transport: Arc<T>,
        reducer: Arc<dyn ReducerSink>,
        conflict_resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            client_id,
            store,
            transport,
            reducer,
            conflict_resolver,
            config: RwLock::new(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: None,
                api_key: None,
                encryption: crate::config::EncryptionConfig::disabled(),
                sync_interval_min: 0,
                is_compression_enabled: false,
            }),
            configured: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            cycle_lock: tokio::sync::Mutex::new(()),
            last_known_server_seq: AtomicI64::new(0),
        }
    }

    /// Seeds the resume point for `getOpsSince`. Callers restore this from
    /// wherever they persist it across restarts; `OperationLogStore` as
    /// specified has no dedicated slot for it (see DESIGN.md).
    pub fn set_last_known_server_seq(&self, seq: i64) {
        self.last_known_server_seq.store(seq, Ordering::SeqCst);
    }

    pub fn last_known_server_seq(&self) -> i64 {
        self.last_known_server_seq.load(Ordering::SeqCst)
    }

    pub async fn setup_sync(&self, config: SyncConfig) -> Result<()> {
        let mut guard = self.config.write().await;
        let was_configured = self.configured.swap(true, Ordering::SeqCst);
        let provider_changed = was_configured && !guard.is_same_provider(&config);
        *guard = config;
        drop(guard);
        self.enabled.store(true, Ordering::SeqCst);

        if !was_configured {
            let _guard = self.cycle_lock.lock().await;
            self.recover_on_startup_locked().await?;
        }

        if provider_changed {
            let _guard = self.cycle_lock.lock().await;
            self.force_upload_local_state_locked(ImportReason::Recovery)
                .await?;
        }
        Ok(())
    }

    pub fn disable_sync(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Runs one full sync cycle, looping up to [`MAX_CYCLE_LOOPS`] times if
    /// accepted uploads or LWW recovery ops leave more work to settle.
    pub async fn sync_and_wait(&self) -> Result<SyncOutcome> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(ClientSyncError::SyncDisabled);
        }
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| ClientSyncError::CycleAlreadyInProgress)?;

        let mut total = SyncOutcome::default();
        for _ in 0..MAX_CYCLE_LOOPS {
            match self.download_phase().await? {
                DownloadOutcome::Conflict(conflicting_remote_ops) => {
                    let choice = self
                        .conflict_resolver
                        .resolve(LocalDataConflict {
                            conflicting_remote_ops,
                        })
                        .await;
                    match choice {
                        ConflictChoice::UseLocal => {
                            self.force_upload_local_state_locked(ImportReason::Recovery)
                                .await?;
                        }
                        ConflictChoice::UseRemote => {
                            self.force_download_remote_state_locked().await?;
                        }
                        ConflictChoice::Cancel => return Err(ClientSyncError::Cancelled),
                    }
                    total.cycles += 1;
                    continue;
                }
                DownloadOutcome::Applied(count) => {
                    total.downloaded += count;
                }
            }

            let upload = self.upload_phase().await?;
            total.uploaded += upload.accepted;
            total.rejected += upload.rejected;
            total.recovered += upload.recovered;
            total.cycles += 1;

            if upload.accepted == 0 && upload.recovered == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn download_phase(&self) -> Result<DownloadOutcome> {
        self.store.clear_vector_clock_cache().await;
        let since = self.last_known_server_seq.load(Ordering::SeqCst);
        let response = self
            .transport
            .download(since, DOWNLOAD_PAGE_LIMIT)
            .await
            .map_err(transport_err)?;

        let local_full_state = self
            .store
            .get_latest_full_state_op()
            .await
            .map_err(storage_err)?;

        let mut kept = Vec::new();
        for stored in &response.ops {
            let op = &stored.operation;
            if !opsync_core::import_filter::keep(op, local_full_state.as_ref()) {
                continue;
            }
            if self.store.is_applied(&op.id).await.map_err(storage_err)? {
                continue;
            }
            kept.push(op.clone());
        }

        if self
            .has_local_data_conflict(&kept, local_full_state.as_ref())
            .await?
        {
            let conflicting = kept
                .into_iter()
                .filter(|op| op.op_type.is_full_state() && op.client_id != self.client_id)
                .collect();
            return Ok(DownloadOutcome::Conflict(conflicting));
        }

        if kept.is_empty() {
            self.last_known_server_seq
                .store(response.max_server_seq, Ordering::SeqCst);
            return Ok(DownloadOutcome::Applied(0));
        }

        let entries = self
            .store
            .append_batch(kept.clone(), OpSource::Remote)
            .await
            .map_err(storage_err)?;

        let config = self.config.read().await;
        for op in &kept {
            let decoded = self.maybe_decrypt(op, &config)?;
            self.reducer
                .apply(&decoded)
                .await
                .map_err(|e| ClientSyncError::Reducer {
                    op_id: op.id.clone(),
                    source: e.to_string(),
                })?;
        }
        drop(config);

        let seqs: Vec<i64> = entries.iter().map(|e| e.seq).collect();
        self.store.mark_applied(&seqs).await.map_err(storage_err)?;
        self.store
            .merge_remote_op_clocks(&kept)
            .await
            .map_err(storage_err)?;
        self.last_known_server_seq
            .store(response.max_server_seq, Ordering::SeqCst);

        Ok(DownloadOutcome::Applied(kept.len()))
    }

    /// A `LocalDataConflict` arises when a downloaded, filter-surviving
    /// full-state op from another client collides with a full-state change
    /// this device has authored but not yet uploaded — two competing clean
    /// slates. Ordinary per-entity concurrency is handled by LWW recovery in
    /// the upload phase, not here.
    async fn has_local_data_conflict(
        &self,
        kept: &[Operation],
        local_full_state: Option<&Operation>,
    ) -> Result<bool> {
        let has_foreign_full_state = kept
            .iter()
            .any(|op| op.op_type.is_full_state() && op.client_id != self.client_id);
        if !has_foreign_full_state {
            return Ok(false);
        }
        let Some(local_full_state) = local_full_state else {
            return Ok(false);
        };
        let unsynced = self.store.get_unsynced().await.map_err(storage_err)?;
        Ok(unsynced
            .iter()
            .any(|entry| entry.operation.id == local_full_state.id))
    }

    async fn upload_phase(&self) -> Result<UploadOutcome> {
        let unsynced = self.store.get_unsynced().await.map_err(storage_err)?;
        if unsynced.is_empty() {
            return Ok(UploadOutcome::default());
        }

        let batch: Vec<Operation> = unsynced
            .iter()
            .take(DOWNLOAD_PAGE_LIMIT as usize)
            .map(|entry| entry.operation.clone())
            .collect();

        let response = self
            .transport
            .upload(&self.client_id, batch)
            .await
            .map_err(transport_err)?;

        let mut accepted_seqs = Vec::new();
        let mut rejected_ids = Vec::new();
        let mut recovery_ops = Vec::new();

        for result in response.results {
            let Some(entry) = unsynced.iter().find(|e| e.operation.id == result.op_id) else {
                continue;
            };

            if result.accepted {
                accepted_seqs.push(entry.seq);
                continue;
            }

            rejected_ids.push(entry.operation.id.clone());

            if let Some(existing_clock) = result.existing_clock {
                let local_clock = self.store.get_vector_clock().await.map_err(storage_err)?;
                let merged = existing_clock
                    .merge(&local_clock)
                    .increment(&self.client_id);
                recovery_ops.push(Operation {
                    id: Uuid::now_v7().to_string(),
                    client_id: self.client_id.clone(),
                    op_type: OpType::Lww,
                    entity_type: entry.operation.entity_type.clone(),
                    entity_id: entry.operation.entity_id.clone(),
                    payload: entry.operation.payload.clone(),
                    vector_clock: merged,
                    timestamp_ms: now_ms(),
                    schema_version: entry.operation.schema_version,
                    reason: None,
                });
            }
        }

        if !accepted_seqs.is_empty() {
            self.store
                .mark_synced(&accepted_seqs)
                .await
                .map_err(storage_err)?;
        }
        if !rejected_ids.is_empty() {
            self.store
                .mark_rejected(&rejected_ids)
                .await
                .map_err(storage_err)?;
        }
        if !recovery_ops.is_empty() {
            self.store
                .append_batch(recovery_ops.clone(), OpSource::Local)
                .await
                .map_err(storage_err)?;
        }

        Ok(UploadOutcome {
            accepted: accepted_seqs.len(),
            rejected: rejected_ids.len() - recovery_ops.len(),
            recovered: recovery_ops.len(),
        })
    }

    async fn force_upload_local_state_locked(&self, reason: ImportReason) -> Result<()> {
        let snapshot = self
            .store
            .load_state_cache()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ClientSyncError::Storage("no local state available to export".into()))?;

        self.store
            .save_state_cache_backup()
            .await
            .map_err(storage_err)?;

        let clock = self
            .store
            .get_vector_clock()
            .await
            .map_err(storage_err)?
            .increment(&self.client_id);

        let config = self.config.read().await;
        let payload = self.maybe_encrypt(&snapshot.state, &config)?;
        drop(config);

        let op = Operation {
            id: Uuid::now_v7().to_string(),
            client_id: self.client_id.clone(),
            op_type: OpType::SyncImport,
            entity_type: ENTITY_TYPE_ALL.to_string(),
            entity_id: None,
            payload,
            vector_clock: clock,
            timestamp_ms: now_ms(),
            schema_version: snapshot.schema_version,
            reason: Some(reason),
        };

        self.store
            .append(op, OpSource::Local)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn force_upload_local_state(&self) -> Result<()> {
        let _guard = self.cycle_lock.lock().await;
        self.force_upload_local_state_locked(ImportReason::Initial)
            .await
    }

    async fn force_download_remote_state_locked(&self) -> Result<()> {
        self.store
            .clear_full_state_ops()
            .await
            .map_err(storage_err)?;
        let unsynced = self.store.get_unsynced().await.map_err(storage_err)?;
        let ids: Vec<String> = unsynced.into_iter().map(|e| e.operation.id).collect();
        if !ids.is_empty() {
            self.store.mark_rejected(&ids).await.map_err(storage_err)?;
        }
        self.last_known_server_seq.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub async fn force_download_remote_state(&self) -> Result<()> {
        let _guard = self.cycle_lock.lock().await;
        self.force_download_remote_state_locked().await
    }

    /// Crash-recovery pass required by §4.3: re-applies `pending` remote ops
    /// (the process died between `appendBatch` and `markApplied`), retries
    /// `failed` remote ops, and restores the state-cache backup if one is
    /// present (evidence of an interrupted migration). `setup_sync` runs
    /// this once, on the first call for a given engine instance; callers
    /// that construct the engine directly against an already-populated
    /// store (e.g. re-attaching to a log from a prior process) can invoke it
    /// explicitly instead.
    pub async fn recover_on_startup(&self) -> Result<RecoveryOutcome> {
        let _guard = self.cycle_lock.lock().await;
        self.recover_on_startup_locked().await
    }

    async fn recover_on_startup_locked(&self) -> Result<RecoveryOutcome> {
        let state_cache_restored = self
            .store
            .restore_state_cache_from_backup()
            .await
            .map_err(storage_err)?
            .is_some();

        let config = self.config.read().await;

        let pending = self
            .store
            .get_pending_remote_ops()
            .await
            .map_err(storage_err)?;
        let pending_reapplied = self.reapply_remote_entries(&pending, &config).await?;

        let failed = self
            .store
            .get_failed_remote_ops()
            .await
            .map_err(storage_err)?;
        let failed_retried = self.reapply_remote_entries(&failed, &config).await?;
        drop(config);

        Ok(RecoveryOutcome {
            pending_reapplied,
            failed_retried,
            state_cache_restored,
        })
    }

    /// Re-dispatches each entry's operation to the reducer, `mark_applied`
    /// on success. An entry that fails again is left for
    /// [`OperationLogStore::mark_failed`] to tombstone once it exceeds its
    /// retry ceiling, rather than aborting the whole recovery pass.
    async fn reapply_remote_entries(
        &self,
        entries: &[OperationLogEntry],
        config: &SyncConfig,
    ) -> Result<usize> {
        let mut applied_seqs = Vec::new();
        let mut failed_ids = Vec::new();
        for entry in entries {
            let decoded = self.maybe_decrypt(&entry.operation, config)?;
            match self.reducer.apply(&decoded).await {
                Ok(()) => applied_seqs.push(entry.seq),
                Err(_) => failed_ids.push(entry.operation.id.clone()),
            }
        }
        if !applied_seqs.is_empty() {
            self.store
                .mark_applied(&applied_seqs)
                .await
                .map_err(storage_err)?;
        }
        if !failed_ids.is_empty() {
            self.store
                .mark_failed(&failed_ids, None)
                .await
                .map_err(storage_err)?;
        }
        Ok(applied_seqs.len())
    }

    fn maybe_encrypt(
        &self,
        value: &serde_json::Value,
        config: &SyncConfig,
    ) -> Result<serde_json::Value> {
        if !config.encryption.enabled {
            return Ok(value.clone());
        }
        let password = config
            .encryption
            .password
            .as_deref()
            .ok_or(ClientSyncError::Decryption)?;
        let plaintext =
            serde_json::to_vec(value).map_err(|e| ClientSyncError::Storage(e.to_string()))?;
        let envelope = crypto::encrypt_payload(password, &plaintext);
        serde_json::to_value(envelope).map_err(|e| ClientSyncError::Storage(e.to_string()))
    }

    fn maybe_decrypt(&self, op: &Operation, config: &SyncConfig) -> Result<Operation> {
        if !config.encryption.enabled {
            return Ok(op.clone());
        }
        let password = config
            .encryption
            .password
            .as_deref()
            .ok_or(ClientSyncError::Decryption)?;
        let envelope: EncryptionEnvelope =
            serde_json::from_value(op.payload.clone()).map_err(|_| ClientSyncError::Decryption)?;
        let plaintext = crypto::decrypt_payload(password, &envelope)?;
        let value: serde_json::Value =
            serde_json::from_slice(&plaintext).map_err(|_| ClientSyncError::Decryption)?;
        let mut decrypted = op.clone();
        decrypted.payload = value;
        Ok(decrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::NullReducerSink;
    use async_trait::async_trait;
    use opsync_core::operation::{ApplicationStatus, OperationLogEntry, StateSnapshot};
    use opsync_core::vector_clock::VectorClock;
    use opsync_core::wire::{DownloadResponse, UploadResponse, UploadResult};
    use opsync_core::StoredOperation;
    use std::collections::HashSet;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Debug, thiserror::Error)]
    #[error("fake store error: {0}")]
    struct FakeStoreError(String);

    #[derive(Default)]
    struct FakeStoreInner {
        entries: Vec<OperationLogEntry>,
        next_seq: i64,
        vector_clock: VectorClock,
        state_cache: Option<StateSnapshot>,
        state_cache_backup: Option<StateSnapshot>,
        applied_ids: HashSet<String>,
        compaction_counter: u64,
    }

    #[derive(Default)]
    struct FakeStore(AsyncMutex<FakeStoreInner>);

    #[async_trait]
    impl OperationLogStore for FakeStore {
        type Error = FakeStoreError;

        async fn append(
            &self,
            op: Operation,
            source: OpSource,
        ) -> std::result::Result<OperationLogEntry, Self::Error> {
            let mut inner = self.0.lock().await;
            inner.next_seq += 1;
            let seq = inner.next_seq;
            if source == OpSource::Local {
                let updated = inner.vector_clock.increment(&op.client_id);
                inner.vector_clock = updated;
            }
            let entry = OperationLogEntry {
                seq,
                operation: op,
                source,
                applied_at: 0,
                synced_at: None,
                rejected_at: None,
                application_status: ApplicationStatus::Pending,
                retry_count: 0,
            };
            inner.entries.push(entry.clone());
            Ok(entry)
        }

        async fn append_batch(
            &self,
            ops: Vec<Operation>,
            source: OpSource,
        ) -> std::result::Result<Vec<OperationLogEntry>, Self::Error> {
            let mut out = Vec::new();
            for op in ops {
                out.push(self.append(op, source).await?);
            }
            Ok(out)
        }

        async fn get_ops_after_seq(
            &self,
            seq: i64,
        ) -> std::result::Result<Vec<OperationLogEntry>, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner
                .entries
                .iter()
                .filter(|e| e.seq > seq)
                .cloned()
                .collect())
        }

        async fn get_unsynced(&self) -> std::result::Result<Vec<OperationLogEntry>, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner
                .entries
                .iter()
                .filter(|e| e.synced_at.is_none() && e.rejected_at.is_none())
                .cloned()
                .collect())
        }

        async fn mark_synced(&self, seqs: &[i64]) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            for entry in inner.entries.iter_mut() {
                if seqs.contains(&entry.seq) {
                    entry.synced_at = Some(1);
                }
            }
            Ok(())
        }

        async fn mark_rejected(&self, op_ids: &[String]) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            for entry in inner.entries.iter_mut() {
                if op_ids.contains(&entry.operation.id) {
                    entry.rejected_at = Some(1);
                }
            }
            Ok(())
        }

        async fn mark_applied(&self, seqs: &[i64]) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            for entry in inner.entries.iter_mut() {
                if seqs.contains(&entry.seq) {
                    entry.application_status = ApplicationStatus::Applied;
                    inner.applied_ids.insert(entry.operation.id.clone());
                }
            }
            Ok(())
        }

        async fn mark_failed(
            &self,
            op_ids: &[String],
            _max_retries: Option<u32>,
        ) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            for entry in inner.entries.iter_mut() {
                if op_ids.contains(&entry.operation.id) {
                    entry.application_status = ApplicationStatus::Failed;
                    entry.retry_count += 1;
                }
            }
            Ok(())
        }

        async fn get_latest_full_state_op(
            &self,
        ) -> std::result::Result<Option<Operation>, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner
                .entries
                .iter()
                .filter(|e| e.operation.op_type.is_full_state())
                .map(|e| e.operation.clone())
                .max_by(|a, b| a.id.cmp(&b.id)))
        }

        async fn clear_full_state_ops(&self) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            inner.entries.retain(|e| !e.operation.op_type.is_full_state());
            Ok(())
        }

        async fn has_synced_ops(&self) -> std::result::Result<bool, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner.entries.iter().any(|e| e.synced_at.is_some()))
        }

        async fn get_pending_remote_ops(
            &self,
        ) -> std::result::Result<Vec<OperationLogEntry>, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner
                .entries
                .iter()
                .filter(|e| {
                    e.source == OpSource::Remote
                        && e.application_status == ApplicationStatus::Pending
                })
                .cloned()
                .collect())
        }

        async fn get_failed_remote_ops(
            &self,
        ) -> std::result::Result<Vec<OperationLogEntry>, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner
                .entries
                .iter()
                .filter(|e| {
                    e.source == OpSource::Remote
                        && e.application_status == ApplicationStatus::Failed
                })
                .cloned()
                .collect())
        }

        async fn is_applied(&self, op_id: &str) -> std::result::Result<bool, Self::Error> {
            let inner = self.0.lock().await;
            Ok(inner.applied_ids.contains(op_id))
        }

        async fn save_state_cache(
            &self,
            snapshot: StateSnapshot,
        ) -> std::result::Result<(), Self::Error> {
            self.0.lock().await.state_cache = Some(snapshot);
            Ok(())
        }

        async fn load_state_cache(
            &self,
        ) -> std::result::Result<Option<StateSnapshot>, Self::Error> {
            Ok(self.0.lock().await.state_cache.clone())
        }

        async fn save_state_cache_backup(&self) -> std::result::Result<(), Self::Error> {
            let mut inner = self.0.lock().await;
            inner.state_cache_backup = inner.state_cache.clone();
            Ok(())
        }

        async fn restore_state_cache_from_backup(
            &self,
        ) -> std::result::Result<Option<StateSnapshot>, Self::Error> {
            Ok(self.0.lock().await.state_cache_backup.clone())
        }

        async fn get_vector_clock(&self) -> std::result::Result<VectorClock, Self::Error> {
            Ok(self.0.lock().await.vector_clock.clone())
        }

        async fn set_vector_clock(
            &self,
            vector_clock: VectorClock,
        ) -> std::result::Result<(), Self::Error> {
            self.0.lock().await.vector_clock = vector_clock;
            Ok(())
        }

        async fn merge_remote_op_clocks(
            &self,
            ops: &[Operation],
        ) -> std::result::Result<VectorClock, Self::Error> {
            let mut inner = self.0.lock().await;
            let mut merged = inner.vector_clock.clone();
            for op in ops {
                merged = merged.merge(&op.vector_clock);
            }
            inner.vector_clock = merged.clone();
            Ok(merged)
        }

        async fn clear_vector_clock_cache(&self) {}

        async fn increment_compaction_counter(&self) -> std::result::Result<u64, Self::Error> {
            let mut inner = self.0.lock().await;
            inner.compaction_counter += 1;
            Ok(inner.compaction_counter)
        }

        async fn reset_compaction_counter(&self) -> std::result::Result<(), Self::Error> {
            self.0.lock().await.compaction_counter = 0;
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("fake transport error")]
    struct FakeTransportError;

    #[derive(Default)]
    struct FakeTransport {
        remote_ops: AsyncMutex<Vec<StoredOperation>>,
        upload_results: AsyncMutex<Vec<UploadResult>>,
        uploaded: AsyncMutex<Vec<Operation>>,
    }

    #[async_trait]
    impl SyncTransport for FakeTransport {
        type Error = FakeTransportError;

        async fn upload(
            &self,
            _client_id: &ClientId,
            ops: Vec<Operation>,
        ) -> std::result::Result<UploadResponse, Self::Error> {
            self.uploaded.lock().await.extend(ops.iter().cloned());
            let queued = self.upload_results.lock().await;
            if !queued.is_empty() {
                return Ok(UploadResponse {
                    results: queued.clone(),
                });
            }
            Ok(UploadResponse {
                results: ops
                    .into_iter()
                    .map(|op| UploadResult {
                        op_id: op.id,
                        accepted: true,
                        server_seq: Some(1),
                        error_code: None,
                        existing_clock: None,
                    })
                    .collect(),
            })
        }

        async fn download(
            &self,
            _since_seq: i64,
            _limit: u32,
        ) -> std::result::Result<DownloadResponse, Self::Error> {
            let ops = self.remote_ops.lock().await.clone();
            let max_server_seq = ops.iter().map(|o| o.server_seq).max().unwrap_or(0);
            Ok(DownloadResponse {
                ops,
                max_server_seq,
            })
        }

        async fn user_sync_state(&self) -> std::result::Result<i64, Self::Error> {
            Ok(0)
        }
    }

    fn client_id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn local_op(client: &str, entity_id: &str, counter: u64) -> Operation {
        let client_id = client_id(client);
        let mut vc = VectorClock::new();
        for _ in 0..counter {
            vc = vc.increment(&client_id);
        }
        Operation {
            id: Uuid::now_v7().to_string(),
            client_id,
            op_type: OpType::Upd,
            entity_type: "task".into(),
            entity_id: Some(entity_id.into()),
            payload: serde_json::json!({"title": "buy milk"}),
            vector_clock: vc,
            timestamp_ms: 1,
            schema_version: 1,
            reason: None,
        }
    }

    fn make_engine() -> ClientSyncEngine<FakeStore, FakeTransport> {
        ClientSyncEngine::new(
            client_id("device-a"),
            Arc::new(FakeStore::default()),
            Arc::new(FakeTransport::default()),
            Arc::new(NullReducerSink),
            Arc::new(crate::conflict::AlwaysCancelResolver),
        )
    }

    #[tokio::test]
    async fn sync_is_disabled_until_setup_sync_is_called() {
        let engine = make_engine();
        assert!(matches!(
            engine.sync_and_wait().await,
            Err(ClientSyncError::SyncDisabled)
        ));
    }

    #[tokio::test]
    async fn enabled_engine_with_nothing_to_do_produces_a_zero_outcome() {
        let engine = make_engine();
        engine
            .setup_sync(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: Some("https://example.test".into()),
                api_key: None,
                encryption: crate::config::EncryptionConfig::disabled(),
                sync_interval_min: 5,
                is_compression_enabled: false,
            })
            .await
            .unwrap();

        let outcome = engine.sync_and_wait().await.unwrap();
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.rejected, 0);
    }

    #[tokio::test]
    async fn local_op_uploads_and_is_marked_synced() {
        let engine = make_engine();
        engine
            .setup_sync(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: Some("https://example.test".into()),
                api_key: None,
                encryption: crate::config::EncryptionConfig::disabled(),
                sync_interval_min: 5,
                is_compression_enabled: false,
            })
            .await
            .unwrap();

        let op = local_op("device-a", "task-1", 1);
        engine.store.append(op, OpSource::Local).await.unwrap();

        let outcome = engine.sync_and_wait().await.unwrap();
        assert_eq!(outcome.uploaded, 1);

        let unsynced = engine.store.get_unsynced().await.unwrap();
        assert!(unsynced.is_empty());
    }

    #[tokio::test]
    async fn rejection_with_existing_clock_synthesizes_an_lww_recovery_op() {
        let engine = make_engine();
        engine
            .setup_sync(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: Some("https://example.test".into()),
                api_key: None,
                encryption: crate::config::EncryptionConfig::disabled(),
                sync_interval_min: 5,
                is_compression_enabled: false,
            })
            .await
            .unwrap();

        let op = local_op("device-a", "task-1", 1);
        let op_id = op.id.clone();
        engine.store.append(op, OpSource::Local).await.unwrap();

        let mut existing_clock = VectorClock::new();
        existing_clock = existing_clock.increment(&client_id("device-b"));
        *engine.transport.upload_results.lock().await = vec![UploadResult {
            op_id,
            accepted: false,
            server_seq: None,
            error_code: Some(opsync_core::wire::WireErrorCode::ConflictConcurrent),
            existing_clock: Some(existing_clock),
        }];

        let outcome = engine.sync_and_wait().await.unwrap();
        assert_eq!(outcome.recovered, 1);

        let entries = engine.store.get_ops_after_seq(0).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.operation.op_type == OpType::Lww));
    }

    #[tokio::test]
    async fn encrypted_payload_round_trips_through_a_sync_cycle() {
        let engine = make_engine();
        engine
            .setup_sync(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: Some("https://example.test".into()),
                api_key: None,
                encryption: crate::config::EncryptionConfig {
                    enabled: true,
                    password: Some("correct horse battery staple".into()),
                },
                sync_interval_min: 5,
                is_compression_enabled: false,
            })
            .await
            .unwrap();

        engine
            .store
            .save_state_cache(StateSnapshot {
                state: serde_json::json!({"tasks": []}),
                last_applied_op_seq: 0,
                vector_clock: VectorClock::new(),
                compacted_at: 0,
                schema_version: 1,
                compaction_counter: 0,
                entity_keys: vec![],
            })
            .await
            .unwrap();

        engine.force_upload_local_state().await.unwrap();
        let entries = engine.store.get_ops_after_seq(0).await.unwrap();
        let import_op = entries
            .iter()
            .find(|e| e.operation.op_type == OpType::SyncImport)
            .unwrap();
        assert!(import_op.operation.payload.get("ciphertext").is_some());
    }

    #[tokio::test]
    async fn setup_sync_reapplies_pending_and_retries_failed_remote_ops_on_first_call() {
        let engine = make_engine();

        let pending_op = local_op("device-b", "task-1", 1);
        let pending_id = pending_op.id.clone();
        engine
            .store
            .append(pending_op, OpSource::Remote)
            .await
            .unwrap();

        let failed_op = local_op("device-b", "task-2", 1);
        let failed_id = failed_op.id.clone();
        engine
            .store
            .append(failed_op, OpSource::Remote)
            .await
            .unwrap();
        engine.store.mark_failed(&[failed_id.clone()], None).await.unwrap();

        engine
            .setup_sync(SyncConfig {
                backend: crate::config::Backend::Server,
                base_url: Some("https://example.test".into()),
                api_key: None,
                encryption: crate::config::EncryptionConfig::disabled(),
                sync_interval_min: 5,
                is_compression_enabled: false,
            })
            .await
            .unwrap();

        assert!(engine.store.is_applied(&pending_id).await.unwrap());
        assert!(engine.store.is_applied(&failed_id).await.unwrap());
    }

    #[tokio::test]
    async fn recover_on_startup_restores_an_interrupted_migration_backup() {
        let engine = make_engine();
        let snapshot = StateSnapshot {
            state: serde_json::json!({"tasks": []}),
            last_applied_op_seq: 5,
            vector_clock: VectorClock::new(),
            compacted_at: 0,
            schema_version: 1,
            compaction_counter: 0,
            entity_keys: vec![],
        };
        engine.store.save_state_cache(snapshot).await.unwrap();
        engine.store.save_state_cache_backup().await.unwrap();

        let outcome = engine.recover_on_startup().await.unwrap();
        assert!(outcome.state_cache_restored);
    }

    #[tokio::test]
    async fn setup_sync_only_runs_recovery_on_the_first_call() {
        let engine = make_engine();
        let config = SyncConfig {
            backend: crate::config::Backend::Server,
            base_url: Some("https://example.test".into()),
            api_key: None,
            encryption: crate::config::EncryptionConfig::disabled(),
            sync_interval_min: 5,
            is_compression_enabled: false,
        };
        engine.setup_sync(config.clone()).await.unwrap();

        // A remote op landing after the engine is already running should
        // not be silently "recovered" a second time by a later setup_sync
        // call (e.g. the UI re-saving the same settings) the way it was on
        // the very first call.
        let pending_op = local_op("device-b", "task-1", 1);
        let pending_id = pending_op.id.clone();
        engine
            .store
            .append(pending_op, OpSource::Remote)
            .await
            .unwrap();

        engine.setup_sync(config).await.unwrap();
        assert!(!engine.store.is_applied(&pending_id).await.unwrap());
    }
}
