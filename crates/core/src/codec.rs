//! Conversion between the verbose, wire/API-facing [`Operation`] shape and
//! the compact, short-keyed shape used on durable storage.
//!
//! `decode(encode(op)) == op` for every operation; the codec only renames
//! fields and reshapes the envelope, it never drops or reinterprets data.

use crate::client_id::ClientId;
use crate::operation::{ImportReason, OpType, Operation};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage-representation of an [`Operation`], with short field names to
/// keep the on-disk row small. Field order mirrors [`Operation`]
/// one-for-one; nothing is recomputed or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactOperation {
    pub i: String,
    pub c: String,
    pub t: CompactOpType,
    pub et: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ei: Option<String>,
    pub p: serde_json::Value,
    pub vc: BTreeMap<String, u64>,
    pub ts: i64,
    pub sv: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<CompactImportReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactOpType {
    Crt,
    Upd,
    Del,
    Lww,
    Batch,
    Si,
    Bi,
    Rp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactImportReason {
    I,
    R,
}

fn op_type_to_compact(t: OpType) -> CompactOpType {
    match t {
        OpType::Crt => CompactOpType::Crt,
        OpType::Upd => CompactOpType::Upd,
        OpType::Del => CompactOpType::Del,
        OpType::Lww => CompactOpType::Lww,
        OpType::Batch => CompactOpType::Batch,
        OpType::SyncImport => CompactOpType::Si,
        OpType::BackupImport => CompactOpType::Bi,
        OpType::Repair => CompactOpType::Rp,
    }
}

fn op_type_from_compact(t: CompactOpType) -> OpType {
    match t {
        CompactOpType::Crt => OpType::Crt,
        CompactOpType::Upd => OpType::Upd,
        CompactOpType::Del => OpType::Del,
        CompactOpType::Lww => OpType::Lww,
        CompactOpType::Batch => OpType::Batch,
        CompactOpType::Si => OpType::SyncImport,
        CompactOpType::Bi => OpType::BackupImport,
        CompactOpType::Rp => OpType::Repair,
    }
}

fn reason_to_compact(r: ImportReason) -> CompactImportReason {
    match r {
        ImportReason::Initial => CompactImportReason::I,
        ImportReason::Recovery => CompactImportReason::R,
    }
}

fn reason_from_compact(r: CompactImportReason) -> ImportReason {
    match r {
        CompactImportReason::I => ImportReason::Initial,
        CompactImportReason::R => ImportReason::Recovery,
    }
}

fn vector_clock_to_map(vc: &VectorClock) -> BTreeMap<String, u64> {
    vc.entries()
        .map(|(client_id, counter)| (client_id.as_str().to_string(), counter))
        .collect()
}

/// Rebuilds a [`VectorClock`] from a compact map. Entries with an invalid
/// (empty) client id are dropped rather than failing the whole decode, since
/// a corrupt single entry shouldn't make an otherwise-valid operation
/// unreadable.
fn vector_clock_from_map(map: &BTreeMap<String, u64>) -> VectorClock {
    let mut vc = VectorClock::new();
    for (key, counter) in map {
        if let Ok(client_id) = ClientId::new(key.clone()) {
            for _ in 0..*counter {
                vc = vc.increment(&client_id);
            }
        }
    }
    vc
}

/// Encodes a verbose [`Operation`] into its compact storage representation.
pub fn encode(op: &Operation) -> CompactOperation {
    CompactOperation {
        i: op.id.clone(),
        c: op.client_id.as_str().to_string(),
        t: op_type_to_compact(op.op_type),
        et: op.entity_type.clone(),
        ei: op.entity_id.clone(),
        p: op.payload.clone(),
        vc: vector_clock_to_map(&op.vector_clock),
        ts: op.timestamp_ms,
        sv: op.schema_version,
        r: op.reason.map(reason_to_compact),
    }
}

/// Error returned when a [`CompactOperation`] cannot be decoded back into a
/// valid [`Operation`] (e.g. a corrupted or truncated storage row).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("compact operation has an invalid client id: {0}")]
    InvalidClientId(String),
}

/// Decodes a compact storage row back into a verbose [`Operation`].
pub fn decode(compact: &CompactOperation) -> Result<Operation, CodecError> {
    let client_id = ClientId::new(compact.c.clone())
        .map_err(|_| CodecError::InvalidClientId(compact.c.clone()))?;
    Ok(Operation {
        id: compact.i.clone(),
        client_id,
        op_type: op_type_from_compact(compact.t),
        entity_type: compact.et.clone(),
        entity_id: compact.ei.clone(),
        payload: compact.p.clone(),
        vector_clock: vector_clock_from_map(&compact.vc),
        timestamp_ms: compact.ts,
        schema_version: compact.sv,
        reason: compact.r.map(reason_from_compact),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op() -> Operation {
        let client_id = ClientId::new("device-a").unwrap();
        let vc = VectorClock::new().increment(&client_id).increment(&client_id);
        Operation {
            id: "01900000-0000-7000-8000-000000000000".into(),
            client_id,
            op_type: OpType::Upd,
            entity_type: "task".into(),
            entity_id: Some("task-1".into()),
            payload: serde_json::json!({"title": "buy milk"}),
            vector_clock: vc,
            timestamp_ms: 1_700_000_000_000,
            schema_version: 3,
            reason: None,
        }
    }

    #[test]
    fn round_trips_a_plain_update() {
        let op = sample_op();
        let decoded = decode(&encode(&op)).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn round_trips_a_full_state_op_with_reason() {
        let mut op = sample_op();
        op.op_type = OpType::SyncImport;
        op.entity_type = crate::operation::ENTITY_TYPE_ALL.into();
        op.entity_id = None;
        op.reason = Some(ImportReason::Initial);
        let decoded = decode(&encode(&op)).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn round_trips_an_empty_vector_clock() {
        let mut op = sample_op();
        op.vector_clock = VectorClock::new();
        let decoded = decode(&encode(&op)).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn decode_rejects_invalid_client_id() {
        let mut compact = encode(&sample_op());
        compact.c = "".into();
        assert!(decode(&compact).is_err());
    }
}
