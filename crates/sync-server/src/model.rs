//! Diesel row type for a stored operation and its `to_domain`/`from_domain`
//! conversions, mirroring `opsync-storage-sqlite::model`'s `OpDB` pattern one
//! crate up the stack.

use crate::error::Result;
use crate::schema::stored_ops;
use chrono::Utc;
use opsync_core::{ClientId, ImportReason, OpType, Operation, StoredOperation, VectorClock};

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

#[derive(Debug, Clone, diesel::Queryable, diesel::Insertable)]
#[diesel(table_name = stored_ops)]
pub struct StoredOpDB {
    pub server_seq: i64,
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
    pub received_at: i64,
}

impl StoredOpDB {
    /// `server_seq` is left at 0; the caller relies on SQLite's
    /// `AUTOINCREMENT` to assign the real value on insert.
    pub fn from_domain(user_id: &str, op: &Operation, received_at: i64) -> Result<Self> {
        let _ = user_id; // one physical database per user; not a column here.
        Ok(Self {
            server_seq: 0,
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
            received_at,
        })
    }

    pub fn to_operation(&self) -> Result<Operation> {
        let client_id = ClientId::new(self.client_id.clone()).map_err(opsync_core::SyncError::from)?;
        let op_type: OpType = enum_from_db(&self.op_type)?;
        let reason: Option<ImportReason> = self.reason.as_deref().map(enum_from_db).transpose()?;
        Ok(Operation {
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
        })
    }

    pub fn to_domain(&self, user_id: &str) -> Result<StoredOperation> {
        Ok(StoredOperation {
            server_seq: self.server_seq,
            user_id: user_id.to_string(),
            operation: self.to_operation()?,
            received_at: self.received_at,
        })
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::ClientId as Cid;

    #[test]
    fn stored_op_round_trips_through_domain() {
        let client_id = Cid::new("device-a").unwrap();
        let op = Operation {
            id: "01".into(),
            client_id,
            op_type: OpType::Upd,
            entity_type: "task".into(),
            entity_id: Some("t1".into()),
            payload: serde_json::json!({"a": 1}),
            vector_clock: VectorClock::new(),
            timestamp_ms: 123,
            schema_version: 1,
            reason: None,
        };
        let mut row = StoredOpDB::from_domain("user-1", &op, 999).unwrap();
        row.server_seq = 7;
        let stored = row.to_domain("user-1").unwrap();
        assert_eq!(stored.server_seq, 7);
        assert_eq!(stored.user_id, "user-1");
        assert_eq!(stored.operation, op);
    }
}
