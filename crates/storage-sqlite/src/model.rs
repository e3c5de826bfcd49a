//! Diesel row types and the `to_domain`/`from_domain` conversions that map
//! them onto the pure domain types in `opsync_core`.

use crate::error::{Result, StorageError};
use crate::schema::{archive_old, archive_young, import_backup, ops, state_cache, state_cache_backup};
use chrono::Utc;
use opsync_core::{
    ApplicationStatus, ClientId, ImportBackup, ImportReason, OpSource, OpType, Operation,
    OperationLogEntry, StateSnapshot, VectorClock,
};

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{value}\""))?)
}

pub(crate) fn vector_clock_to_json(vc: &VectorClock) -> Result<String> {
    let map: std::collections::BTreeMap<String, u64> = vc
        .entries()
        .map(|(id, counter)| (id.as_str().to_string(), counter))
        .collect();
    Ok(serde_json::to_string(&map)?)
}

pub(crate) fn vector_clock_from_json(raw: &str) -> Result<VectorClock> {
    let map: std::collections::BTreeMap<String, u64> = serde_json::from_str(raw)?;
    let mut vc = VectorClock::new();
    for (key, counter) in map {
        let client_id = ClientId::new(key).map_err(opsync_core::SyncError::from)?;
        for _ in 0..counter {
            vc = vc.increment(&client_id);
        }
    }
    Ok(vc)
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable, diesel::AsChangeset)]
#[diesel(table_name = ops)]
pub struct OpDB {
    pub seq: i64,
    pub id: String,
    pub client_id: String,
    pub op_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: String,
    pub vector_clock: String,
    pub timestamp_ms: i64,
    pub schema_version: i32,
    pub reason: Option<String>,
    pub source: String,
    pub applied_at: i64,
    pub synced_at: Option<i64>,
    pub rejected_at: Option<i64>,
    pub application_status: String,
    pub retry_count: i32,
}

impl OpDB {
    pub fn from_domain(entry: &OperationLogEntry) -> Result<Self> {
        let op = &entry.operation;
        Ok(Self {
            seq: entry.seq,
            id: op.id.clone(),
            client_id: op.client_id.as_str().to_string(),
            op_type: enum_to_db(&op.op_type)?,
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            payload: serde_json::to_string(&op.payload)?,
            vector_clock: vector_clock_to_json(&op.vector_clock)?,
            timestamp_ms: op.timestamp_ms,
            schema_version: op.schema_version as i32,
            reason: op.reason.map(|r| enum_to_db(&r)).transpose()?,
            source: enum_to_db(&entry.source)?,
            applied_at: entry.applied_at,
            synced_at: entry.synced_at,
            rejected_at: entry.rejected_at,
            application_status: enum_to_db(&entry.application_status)?,
            retry_count: entry.retry_count as i32,
        })
    }

    pub fn to_domain(&self) -> Result<OperationLogEntry> {
        let client_id = ClientId::new(self.client_id.clone()).map_err(opsync_core::SyncError::from)?;
        let op_type: OpType = enum_from_db(&self.op_type)?;
        let reason: Option<ImportReason> = self.reason.as_deref().map(enum_from_db).transpose()?;
        let source: OpSource = enum_from_db(&self.source)?;
        let application_status: ApplicationStatus = enum_from_db(&self.application_status)?;

        let operation = Operation {
            id: self.id.clone(),
            client_id,
            op_type,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            payload: serde_json::from_str(&self.payload)?,
            vector_clock: vector_clock_from_json(&self.vector_clock)?,
            timestamp_ms: self.timestamp_ms,
            schema_version: self.schema_version as u32,
            reason,
        };

        Ok(OperationLogEntry {
            seq: self.seq,
            operation,
            source,
            applied_at: self.applied_at,
            synced_at: self.synced_at,
            rejected_at: self.rejected_at,
            application_status,
            retry_count: self.retry_count as u32,
        })
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable, diesel::AsChangeset)]
#[diesel(table_name = state_cache)]
pub struct StateCacheDB {
    pub id: i32,
    pub state: String,
    pub last_applied_op_seq: i64,
    pub vector_clock: String,
    pub compacted_at: i64,
    pub schema_version: i32,
    pub compaction_counter: i64,
    pub entity_keys: String,
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable, diesel::AsChangeset)]
#[diesel(table_name = state_cache_backup)]
pub struct StateCacheBackupDB {
    pub id: i32,
    pub state: String,
    pub last_applied_op_seq: i64,
    pub vector_clock: String,
    pub compacted_at: i64,
    pub schema_version: i32,
    pub compaction_counter: i64,
    pub entity_keys: String,
}

pub const SINGLETON_ID: i32 = 1;

impl StateCacheDB {
    pub fn from_domain(snapshot: &StateSnapshot) -> Result<Self> {
        Ok(Self {
            id: SINGLETON_ID,
            state: serde_json::to_string(&snapshot.state)?,
            last_applied_op_seq: snapshot.last_applied_op_seq,
            vector_clock: vector_clock_to_json(&snapshot.vector_clock)?,
            compacted_at: snapshot.compacted_at,
            schema_version: snapshot.schema_version as i32,
            compaction_counter: snapshot.compaction_counter as i64,
            entity_keys: serde_json::to_string(&snapshot.entity_keys)?,
        })
    }

    pub fn to_domain(&self) -> Result<StateSnapshot> {
        Ok(StateSnapshot {
            state: serde_json::from_str(&self.state)?,
            last_applied_op_seq: self.last_applied_op_seq,
            vector_clock: vector_clock_from_json(&self.vector_clock)?,
            compacted_at: self.compacted_at,
            schema_version: self.schema_version as u32,
            compaction_counter: self.compaction_counter as u64,
            entity_keys: serde_json::from_str(&self.entity_keys)?,
        })
    }

    pub fn to_backup(&self) -> StateCacheBackupDB {
        StateCacheBackupDB {
            id: SINGLETON_ID,
            state: self.state.clone(),
            last_applied_op_seq: self.last_applied_op_seq,
            vector_clock: self.vector_clock.clone(),
            compacted_at: self.compacted_at,
            schema_version: self.schema_version,
            compaction_counter: self.compaction_counter,
            entity_keys: self.entity_keys.clone(),
        }
    }
}

impl StateCacheBackupDB {
    pub fn to_domain(&self) -> Result<StateSnapshot> {
        Ok(StateSnapshot {
            state: serde_json::from_str(&self.state)?,
            last_applied_op_seq: self.last_applied_op_seq,
            vector_clock: vector_clock_from_json(&self.vector_clock)?,
            compacted_at: self.compacted_at,
            schema_version: self.schema_version as u32,
            compaction_counter: self.compaction_counter as u64,
            entity_keys: serde_json::from_str(&self.entity_keys)?,
        })
    }

    pub fn to_primary(&self) -> StateCacheDB {
        StateCacheDB {
            id: SINGLETON_ID,
            state: self.state.clone(),
            last_applied_op_seq: self.last_applied_op_seq,
            vector_clock: self.vector_clock.clone(),
            compacted_at: self.compacted_at,
            schema_version: self.schema_version,
            compaction_counter: self.compaction_counter,
            entity_keys: self.entity_keys.clone(),
        }
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable, diesel::AsChangeset)]
#[diesel(table_name = import_backup)]
pub struct ImportBackupDB {
    pub id: i32,
    pub snapshot: String,
    pub saved_at: i64,
}

impl ImportBackupDB {
    pub fn from_domain(backup: &ImportBackup) -> Result<Self> {
        Ok(Self {
            id: SINGLETON_ID,
            snapshot: serde_json::to_string(&backup.snapshot)?,
            saved_at: backup.saved_at,
        })
    }

    pub fn to_domain(&self) -> Result<ImportBackup> {
        Ok(ImportBackup {
            snapshot: serde_json::from_str(&self.snapshot)?,
            saved_at: self.saved_at,
        })
    }
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable)]
#[diesel(table_name = archive_young)]
pub struct ArchiveYoungDB {
    pub seq: i64,
    pub id: String,
    pub client_id: String,
    pub op_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: String,
    pub vector_clock: String,
    pub timestamp_ms: i64,
    pub schema_version: i32,
    pub reason: Option<String>,
    pub archived_at: i64,
}

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable)]
#[diesel(table_name = archive_old)]
pub struct ArchiveOldDB {
    pub seq: i64,
    pub id: String,
    pub client_id: String,
    pub op_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: String,
    pub vector_clock: String,
    pub timestamp_ms: i64,
    pub schema_version: i32,
    pub reason: Option<String>,
    pub archived_at: i64,
}

impl ArchiveYoungDB {
    pub fn from_op_db(op: &OpDB, archived_at: i64) -> Self {
        Self {
            seq: op.seq,
            id: op.id.clone(),
            client_id: op.client_id.clone(),
            op_type: op.op_type.clone(),
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            payload: op.payload.clone(),
            vector_clock: op.vector_clock.clone(),
            timestamp_ms: op.timestamp_ms,
            schema_version: op.schema_version,
            reason: op.reason.clone(),
            archived_at,
        }
    }

    pub fn into_old(self) -> ArchiveOldDB {
        ArchiveOldDB {
            seq: self.seq,
            id: self.id,
            client_id: self.client_id,
            op_type: self.op_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            payload: self.payload,
            vector_clock: self.vector_clock,
            timestamp_ms: self.timestamp_ms,
            schema_version: self.schema_version,
            reason: self.reason,
            archived_at: self.archived_at,
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ClientId as Cid, OpSource, VectorClock};

    #[test]
    fn op_db_round_trips_through_domain() {
        let client_id = Cid::new("device-a").unwrap();
        let vc = VectorClock::new().increment(&client_id);
        let entry = OperationLogEntry {
            seq: 1,
            operation: Operation {
                id: "01".into(),
                client_id,
                op_type: OpType::Upd,
                entity_type: "task".into(),
                entity_id: Some("t1".into()),
                payload: serde_json::json!({"a": 1}),
                vector_clock: vc,
                timestamp_ms: 123,
                schema_version: 1,
                reason: None,
            },
            source: OpSource::Local,
            applied_at: 123,
            synced_at: None,
            rejected_at: None,
            application_status: ApplicationStatus::Pending,
            retry_count: 0,
        };

        let db = OpDB::from_domain(&entry).unwrap();
        let roundtripped = db.to_domain().unwrap();
        assert_eq!(roundtripped, entry);
    }
}
