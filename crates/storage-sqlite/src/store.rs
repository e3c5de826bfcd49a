//! SQLite-backed implementation of [`opsync_core::OperationLogStore`].

use async_trait::async_trait;
use diesel::prelude::*;
use opsync_core::{
    ApplicationStatus, ImportBackup, OpSource, OpType, Operation, OperationLogEntry,
    OperationLogStore, StateSnapshot, VectorClock,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::error::{Result, StorageError};
use crate::model::{
    now_ms, ArchiveYoungDB, ImportBackupDB, OpDB, StateCacheBackupDB, StateCacheDB, SINGLETON_ID,
};
use crate::schema::{
    archive_old, archive_young, compaction_state, import_backup, ops, state_cache,
    state_cache_backup, vector_clock_singleton,
};

/// Full-state op types, matching `OpType::is_full_state`, spelled out as
/// their DB string encoding for use in SQL `IN` clauses.
const FULL_STATE_DB_VALUES: [&str; 3] = ["SYNC_IMPORT", "BACKUP_IMPORT", "REPAIR"];
const ENTITY_TYPES_EXCLUDED_FROM_HAS_SYNCED: [&str; 2] = ["MIGRATION", "RECOVERY"];

#[derive(Default)]
struct UnsyncedCache {
    last_seen_seq: i64,
    entries: Vec<OperationLogEntry>,
}

pub struct SqliteOperationLogStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    applied_op_ids: Mutex<Option<HashSet<String>>>,
    unsynced_cache: Mutex<UnsyncedCache>,
    vector_clock_cache: Mutex<Option<VectorClock>>,
}

impl SqliteOperationLogStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self {
            pool,
            writer,
            applied_op_ids: Mutex::new(None),
            unsynced_cache: Mutex::new(UnsyncedCache::default()),
            vector_clock_cache: Mutex::new(None),
        }
    }

    fn invalidate_caches(&self) {
        *self.applied_op_ids.lock().unwrap() = None;
        *self.unsynced_cache.lock().unwrap() = UnsyncedCache::default();
    }

    fn load_vector_clock_uncached(conn: &mut SqliteConnection) -> Result<VectorClock> {
        let raw: Option<String> = vector_clock_singleton::table
            .find(SINGLETON_ID)
            .select(vector_clock_singleton::vector_clock)
            .first(conn)
            .optional()
            .map_err(StorageError::Database)?;
        match raw {
            Some(raw) => crate::model::vector_clock_from_json(&raw),
            None => Ok(VectorClock::new()),
        }
    }

    fn store_vector_clock(conn: &mut SqliteConnection, vc: &VectorClock) -> Result<()> {
        let raw = crate::model::vector_clock_to_json(vc)?;
        diesel::insert_into(vector_clock_singleton::table)
            .values((
                vector_clock_singleton::id.eq(SINGLETON_ID),
                vector_clock_singleton::vector_clock.eq(&raw),
            ))
            .on_conflict(vector_clock_singleton::id)
            .do_update()
            .set(vector_clock_singleton::vector_clock.eq(&raw))
            .execute(conn)
            .map_err(StorageError::Database)?;
        Ok(())
    }
}

use diesel::sqlite::SqliteConnection;

#[async_trait]
impl OperationLogStore for SqliteOperationLogStore {
    type Error = StorageError;

    async fn append(&self, op: Operation, source: OpSource) -> Result<OperationLogEntry> {
        let mut batch = self.append_batch(vec![op], source).await?;
        batch
            .pop()
            .ok_or_else(|| StorageError::CorruptRow("append produced no entry".into()))
    }

    async fn append_batch(
        &self,
        new_ops: Vec<Operation>,
        source: OpSource,
    ) -> Result<Vec<OperationLogEntry>> {
        if new_ops.is_empty() {
            return Ok(Vec::new());
        }

        let result = self
            .writer
            .exec(move |conn| {
                conn.transaction(|conn| {
                    let mut inserted = Vec::with_capacity(new_ops.len());
                    let mut local_clock = if source == OpSource::Local {
                        Some(SqliteOperationLogStore::load_vector_clock_uncached(conn)?)
                    } else {
                        None
                    };

                    for op in new_ops {
                        let now = now_ms();
                        let entry = OperationLogEntry {
                            seq: 0,
                            operation: op,
                            source,
                            applied_at: now,
                            synced_at: None,
                            rejected_at: None,
                            application_status: ApplicationStatus::Pending,
                            retry_count: 0,
                        };
                        let row = OpDB::from_domain(&entry)?;
                        diesel::insert_into(ops::table)
                            .values((
                                ops::id.eq(&row.id),
                                ops::client_id.eq(&row.client_id),
                                ops::op_type.eq(&row.op_type),
                                ops::entity_type.eq(&row.entity_type),
                                ops::entity_id.eq(&row.entity_id),
                                ops::payload.eq(&row.payload),
                                ops::vector_clock.eq(&row.vector_clock),
                                ops::timestamp_ms.eq(row.timestamp_ms),
                                ops::schema_version.eq(row.schema_version),
                                ops::reason.eq(&row.reason),
                                ops::source.eq(&row.source),
                                ops::applied_at.eq(row.applied_at),
                                ops::synced_at.eq(row.synced_at),
                                ops::rejected_at.eq(row.rejected_at),
                                ops::application_status.eq(&row.application_status),
                                ops::retry_count.eq(row.retry_count),
                            ))
                            .execute(conn)
                            .map_err(StorageError::Database)?;

                        let seq: i64 = ops::table
                            .filter(ops::id.eq(&row.id))
                            .select(ops::seq)
                            .first(conn)
                            .map_err(StorageError::Database)?;

                        if let Some(clock) = local_clock.as_mut() {
                            *clock = clock.increment(&entry.operation.client_id);
                        }

                        let mut persisted = entry;
                        persisted.seq = seq;
                        inserted.push(persisted);
                    }

                    if let Some(clock) = local_clock {
                        SqliteOperationLogStore::store_vector_clock(conn, &clock)?;
                    }

                    Ok(inserted)
                })
            })
            .await;

        match result {
            Ok(inserted) => {
                self.invalidate_caches();
                *self.vector_clock_cache.lock().unwrap() = None;
                Ok(inserted)
            }
            Err(err) => {
                self.invalidate_caches();
                Err(err)
            }
        }
    }

    async fn get_ops_after_seq(&self, seq: i64) -> Result<Vec<OperationLogEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows: Vec<OpDB> = ops::table
            .filter(ops::seq.gt(seq))
            .order(ops::seq.asc())
            .load(&mut conn)
            .map_err(StorageError::Database)?;
        rows.iter().map(OpDB::to_domain).collect()
    }

    async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>> {
        let last_seen = self.unsynced_cache.lock().unwrap().last_seen_seq;

        let mut conn = get_connection(&self.pool)?;
        let fresh_rows: Vec<OpDB> = ops::table
            .filter(ops::seq.gt(last_seen))
            .filter(ops::synced_at.is_null())
            .filter(ops::rejected_at.is_null())
            .order(ops::seq.asc())
            .load(&mut conn)
            .map_err(StorageError::Database)?;
        let max_seq: Option<i64> = ops::table
            .select(diesel::dsl::max(ops::seq))
            .first(&mut conn)
            .map_err(StorageError::Database)?;

        let fresh: Vec<OperationLogEntry> =
            fresh_rows.iter().map(OpDB::to_domain).collect::<Result<_>>()?;

        let mut cache = self.unsynced_cache.lock().unwrap();
        cache.entries.extend(fresh);
        cache.entries.retain(|e| e.synced_at.is_none() && e.rejected_at.is_none());
        if let Some(max_seq) = max_seq {
            cache.last_seen_seq = cache.last_seen_seq.max(max_seq);
        }
        Ok(cache.entries.clone())
    }

    async fn mark_synced(&self, seqs: &[i64]) -> Result<()> {
        let seqs = seqs.to_vec();
        let now = now_ms();
        self.writer
            .exec(move |conn| {
                diesel::update(ops::table.filter(ops::seq.eq_any(&seqs)))
                    .set(ops::synced_at.eq(now))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn mark_rejected(&self, op_ids: &[String]) -> Result<()> {
        let op_ids = op_ids.to_vec();
        let now = now_ms();
        self.writer
            .exec(move |conn| {
                diesel::update(ops::table.filter(ops::id.eq_any(&op_ids)))
                    .set((
                        ops::rejected_at.eq(now),
                        ops::application_status
                            .eq(crate::model::enum_to_db(&ApplicationStatus::Failed)?),
                    ))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn mark_applied(&self, seqs: &[i64]) -> Result<()> {
        let seqs = seqs.to_vec();
        self.writer
            .exec(move |conn| {
                diesel::update(ops::table.filter(ops::seq.eq_any(&seqs)))
                    .set(ops::application_status.eq(crate::model::enum_to_db(&ApplicationStatus::Applied)?))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn mark_failed(&self, op_ids: &[String], max_retries: Option<u32>) -> Result<()> {
        let op_ids_for_fetch = op_ids.to_vec();
        let op_ids_owned = op_ids.to_vec();
        let max_retries = max_retries.unwrap_or(5);
        self.writer
            .exec(move |conn| {
                let rows: Vec<OpDB> = ops::table
                    .filter(ops::id.eq_any(&op_ids_for_fetch))
                    .load(conn)
                    .map_err(StorageError::Database)?;

                for row in rows {
                    let next_retry = row.retry_count + 1;
                    if next_retry as u32 > max_retries {
                        diesel::update(ops::table.filter(ops::seq.eq(row.seq)))
                            .set((
                                ops::rejected_at.eq(now_ms()),
                                ops::retry_count.eq(next_retry),
                                ops::application_status
                                    .eq(crate::model::enum_to_db(&ApplicationStatus::Failed)?),
                            ))
                            .execute(conn)
                            .map_err(StorageError::Database)?;
                    } else {
                        diesel::update(ops::table.filter(ops::seq.eq(row.seq)))
                            .set((
                                ops::retry_count.eq(next_retry),
                                ops::application_status
                                    .eq(crate::model::enum_to_db(&ApplicationStatus::Failed)?),
                            ))
                            .execute(conn)
                            .map_err(StorageError::Database)?;
                    }
                }
                let _ = op_ids_owned;
                Ok(())
            })
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn get_latest_full_state_op(&self) -> Result<Option<Operation>> {
        let mut conn = get_connection(&self.pool)?;
        let row: Option<OpDB> = ops::table
            .filter(ops::op_type.eq_any(FULL_STATE_DB_VALUES))
            .order(ops::id.desc())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::Database)?;
        row.map(|r| r.to_domain().map(|entry| entry.operation))
            .transpose()
    }

    async fn clear_full_state_ops(&self) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::delete(ops::table.filter(ops::op_type.eq_any(FULL_STATE_DB_VALUES)))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await?;
        self.invalidate_caches();
        Ok(())
    }

    async fn has_synced_ops(&self) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let count: i64 = ops::table
            .filter(ops::synced_at.is_not_null())
            .filter(ops::entity_type.ne_all(ENTITY_TYPES_EXCLUDED_FROM_HAS_SYNCED))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::Database)?;
        Ok(count > 0)
    }

    async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows: Vec<OpDB> = ops::table
            .filter(ops::source.eq("remote"))
            .filter(ops::application_status.eq("pending"))
            .order(ops::seq.asc())
            .load(&mut conn)
            .map_err(StorageError::Database)?;
        rows.iter().map(OpDB::to_domain).collect()
    }

    async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows: Vec<OpDB> = ops::table
            .filter(ops::source.eq("remote"))
            .filter(ops::application_status.eq("failed"))
            .filter(ops::rejected_at.is_null())
            .order(ops::seq.asc())
            .load(&mut conn)
            .map_err(StorageError::Database)?;
        rows.iter().map(OpDB::to_domain).collect()
    }

    async fn is_applied(&self, op_id: &str) -> Result<bool> {
        {
            let cache = self.applied_op_ids.lock().unwrap();
            if let Some(set) = cache.as_ref() {
                return Ok(set.contains(op_id));
            }
        }

        let mut conn = get_connection(&self.pool)?;
        let ids: Vec<String> = ops::table
            .filter(ops::application_status.eq("applied"))
            .select(ops::id)
            .load(&mut conn)
            .map_err(StorageError::Database)?;
        let set: HashSet<String> = ids.into_iter().collect();
        let present = set.contains(op_id);
        *self.applied_op_ids.lock().unwrap() = Some(set);
        Ok(present)
    }

    async fn save_state_cache(&self, snapshot: StateSnapshot) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let row = StateCacheDB::from_domain(&snapshot)?;
                diesel::insert_into(state_cache::table)
                    .values(&row)
                    .on_conflict(state_cache::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await
    }

    async fn load_state_cache(&self) -> Result<Option<StateSnapshot>> {
        let mut conn = get_connection(&self.pool)?;
        let row: Option<StateCacheDB> = state_cache::table
            .find(SINGLETON_ID)
            .first(&mut conn)
            .optional()
            .map_err(StorageError::Database)?;
        row.map(|r| r.to_domain()).transpose()
    }

    async fn save_state_cache_backup(&self) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let current: Option<StateCacheDB> = state_cache::table
                    .find(SINGLETON_ID)
                    .first(conn)
                    .optional()
                    .map_err(StorageError::Database)?;
                if let Some(current) = current {
                    let backup = current.to_backup();
                    diesel::insert_into(state_cache_backup::table)
                        .values(&backup)
                        .on_conflict(state_cache_backup::id)
                        .do_update()
                        .set(&backup)
                        .execute(conn)
                        .map_err(StorageError::Database)?;
                }
                Ok(())
            })
            .await
    }

    async fn restore_state_cache_from_backup(&self) -> Result<Option<StateSnapshot>> {
        self.writer
            .exec(move |conn| {
                let backup: Option<StateCacheBackupDB> = state_cache_backup::table
                    .find(SINGLETON_ID)
                    .first(conn)
                    .optional()
                    .map_err(StorageError::Database)?;
                match backup {
                    None => Ok(None),
                    Some(backup) => {
                        let primary = backup.to_primary();
                        diesel::insert_into(state_cache::table)
                            .values(&primary)
                            .on_conflict(state_cache::id)
                            .do_update()
                            .set(&primary)
                            .execute(conn)
                            .map_err(StorageError::Database)?;
                        Ok(Some(backup.to_domain()?))
                    }
                }
            })
            .await
    }

    async fn get_vector_clock(&self) -> Result<VectorClock> {
        {
            let cache = self.vector_clock_cache.lock().unwrap();
            if let Some(vc) = cache.as_ref() {
                return Ok(vc.clone());
            }
        }
        let mut conn = get_connection(&self.pool)?;
        let vc = Self::load_vector_clock_uncached(&mut conn)?;
        *self.vector_clock_cache.lock().unwrap() = Some(vc.clone());
        Ok(vc)
    }

    async fn set_vector_clock(&self, vector_clock: VectorClock) -> Result<()> {
        let vc = vector_clock.clone();
        self.writer
            .exec(move |conn| Self::store_vector_clock(conn, &vc))
            .await?;
        *self.vector_clock_cache.lock().unwrap() = Some(vector_clock);
        Ok(())
    }

    async fn merge_remote_op_clocks(&self, incoming: &[Operation]) -> Result<VectorClock> {
        let clocks: Vec<VectorClock> = incoming.iter().map(|o| o.vector_clock.clone()).collect();
        let merged = self
            .writer
            .exec(move |conn| {
                let mut current = Self::load_vector_clock_uncached(conn)?;
                for clock in &clocks {
                    current = current.merge(clock);
                }
                Self::store_vector_clock(conn, &current)?;
                Ok(current)
            })
            .await?;
        *self.vector_clock_cache.lock().unwrap() = Some(merged.clone());
        Ok(merged)
    }

    async fn clear_vector_clock_cache(&self) {
        *self.vector_clock_cache.lock().unwrap() = None;
    }

    async fn increment_compaction_counter(&self) -> Result<u64> {
        self.writer
            .exec(move |conn| {
                let current: Option<i64> = compaction_state::table
                    .find(SINGLETON_ID)
                    .select(compaction_state::counter)
                    .first(conn)
                    .optional()
                    .map_err(StorageError::Database)?;
                let next = current.unwrap_or(0) + 1;
                diesel::insert_into(compaction_state::table)
                    .values((
                        compaction_state::id.eq(SINGLETON_ID),
                        compaction_state::counter.eq(next),
                    ))
                    .on_conflict(compaction_state::id)
                    .do_update()
                    .set(compaction_state::counter.eq(next))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(next as u64)
            })
            .await
    }

    async fn reset_compaction_counter(&self) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::insert_into(compaction_state::table)
                    .values((
                        compaction_state::id.eq(SINGLETON_ID),
                        compaction_state::counter.eq(0),
                    ))
                    .on_conflict(compaction_state::id)
                    .do_update()
                    .set(compaction_state::counter.eq(0))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await
    }
}

impl SqliteOperationLogStore {
    /// Archives ops with `seq <= upto_seq` out of the hot `ops` table into
    /// `archive_young`, keeping the active table bounded after a compaction.
    /// Rows already in `archive_young` older than `rotate_after_count` get
    /// rolled into `archive_old` to keep that table itself bounded.
    pub async fn archive_compacted_ops(&self, upto_seq: i64) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let rows: Vec<OpDB> = ops::table
                    .filter(ops::seq.le(upto_seq))
                    .load(conn)
                    .map_err(StorageError::Database)?;
                let moved = rows.len();
                let now = now_ms();
                for row in &rows {
                    let archived = ArchiveYoungDB::from_op_db(row, now);
                    diesel::insert_into(archive_young::table)
                        .values(&archived)
                        .execute(conn)
                        .map_err(StorageError::Database)?;
                }
                diesel::delete(ops::table.filter(ops::seq.le(upto_seq)))
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(moved)
            })
            .await
    }

    /// Rotates the oldest `archive_young` rows into `archive_old` once the
    /// young archive exceeds `max_young`.
    pub async fn rotate_archive(&self, max_young: i64) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let count: i64 = archive_young::table
                    .count()
                    .get_result(conn)
                    .map_err(StorageError::Database)?;
                if count <= max_young {
                    return Ok(0);
                }
                let overflow = (count - max_young) as i64;
                let rows: Vec<ArchiveYoungDB> = archive_young::table
                    .order(archive_young::seq.asc())
                    .limit(overflow)
                    .load(conn)
                    .map_err(StorageError::Database)?;
                let moved = rows.len();
                for row in rows {
                    let seq = row.seq;
                    let old = row.into_old();
                    diesel::insert_into(archive_old::table)
                        .values(&old)
                        .execute(conn)
                        .map_err(StorageError::Database)?;
                    diesel::delete(archive_young::table.filter(archive_young::seq.eq(seq)))
                        .execute(conn)
                        .map_err(StorageError::Database)?;
                }
                Ok(moved)
            })
            .await
    }

    pub async fn save_import_backup(&self, backup: ImportBackup) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let row = ImportBackupDB::from_domain(&backup)?;
                diesel::insert_into(import_backup::table)
                    .values(&row)
                    .on_conflict(import_backup::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::Database)?;
                Ok(())
            })
            .await
    }

    pub async fn load_import_backup(&self) -> Result<Option<ImportBackup>> {
        let mut conn = get_connection(&self.pool)?;
        let row: Option<ImportBackupDB> = import_backup::table
            .find(SINGLETON_ID)
            .first(&mut conn)
            .optional()
            .map_err(StorageError::Database)?;
        row.map(|r| r.to_domain()).transpose()
    }
}

// OpType import kept for the full-state DB-value table above to stay in
// sync with `OpType::is_full_state` if new variants are ever added.
#[allow(dead_code)]
fn _assert_full_state_values_cover_enum(t: OpType) -> bool {
    t.is_full_state()
}
