//! [`FileAdapterTransport`]: a [`SyncTransport`] over a single JSON document
//! (§4.8), for backends with no server process of their own (a synced
//! folder, a WebDAV share). Unlike `opsync-sync-server`, it does not run
//! per-entity conflict detection: every uploaded op is accepted and folded
//! into the document's merged vector clock, the whole-document `syncVersion`
//! providing only optimistic concurrency against concurrent writers, never
//! a causal-conflict verdict. This is a deliberate simplification the
//! original design calls out, not an oversight.

use async_trait::async_trait;
use opsync_core::wire::{
    DownloadResponse, FileAdapterDocument, UploadResponse, UploadResult,
    FILE_ADAPTER_RECENT_OPS_CAP,
};
use opsync_core::{ClientId, Operation, StoredOperation, VectorClock};
use opsync_sync_client::transport::SyncTransport;

use crate::backend::FileBackend;
use crate::error::{FileAdapterError, Result};

const MAX_CAS_RETRIES: u32 = 5;

pub struct FileAdapterTransport<B: FileBackend> {
    backend: B,
    /// Label stamped onto [`StoredOperation::user_id`]; this backend has no
    /// real multi-user concept, one document serves one account.
    user_id: String,
}

impl<B: FileBackend> FileAdapterTransport<B> {
    pub fn new(backend: B, user_id: impl Into<String>) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
        }
    }

    fn empty_document() -> FileAdapterDocument {
        FileAdapterDocument {
            state: serde_json::Value::Null,
            recent_ops: Vec::new(),
            vector_clock: VectorClock::new(),
            sync_version: 0,
        }
    }

    async fn read_document(&self) -> Result<(Option<Vec<u8>>, FileAdapterDocument)> {
        match self.backend.read().await? {
            Some(bytes) => {
                let doc: FileAdapterDocument = serde_json::from_slice(&bytes)?;
                Ok((Some(bytes), doc))
            }
            None => Ok((None, Self::empty_document())),
        }
    }
}

#[async_trait]
impl<B: FileBackend> SyncTransport for FileAdapterTransport<B> {
    type Error = FileAdapterError;

    async fn upload(
        &self,
        _client_id: &ClientId,
        ops: Vec<Operation>,
    ) -> Result<UploadResponse> {
        if ops.is_empty() {
            return Ok(UploadResponse { results: vec![] });
        }

        for _attempt in 0..MAX_CAS_RETRIES {
            let (current_bytes, mut doc) = self.read_document().await?;
            let mut next_seq = doc.sync_version;
            let mut results = Vec::with_capacity(ops.len());

            for op in &ops {
                next_seq += 1;
                doc.vector_clock = doc.vector_clock.merge(&op.vector_clock);
                doc.recent_ops.push(op.clone());
                results.push(UploadResult {
                    op_id: op.id.clone(),
                    accepted: true,
                    server_seq: Some(next_seq as i64),
                    error_code: None,
                    existing_clock: None,
                });
            }

            if doc.recent_ops.len() > FILE_ADAPTER_RECENT_OPS_CAP {
                let excess = doc.recent_ops.len() - FILE_ADAPTER_RECENT_OPS_CAP;
                doc.recent_ops.drain(0..excess);
            }
            doc.sync_version = next_seq;

            let new_bytes = serde_json::to_vec(&doc)?;
            let written = self
                .backend
                .compare_and_write(current_bytes.as_deref(), new_bytes)
                .await?;
            if written {
                return Ok(UploadResponse { results });
            }
        }

        Err(FileAdapterError::CasExhausted {
            attempts: MAX_CAS_RETRIES,
        })
    }

    async fn download(&self, since_seq: i64, limit: u32) -> Result<DownloadResponse> {
        let (_, doc) = self.read_document().await?;
        let total = doc.recent_ops.len() as i64;
        let first_seq = doc.sync_version as i64 - total;

        let mut ops = Vec::new();
        for (i, op) in doc.recent_ops.iter().enumerate() {
            let seq = first_seq + 1 + i as i64;
            if seq <= since_seq {
                continue;
            }
            ops.push(StoredOperation {
                server_seq: seq,
                user_id: self.user_id.clone(),
                operation: op.clone(),
                received_at: op.timestamp_ms,
            });
            if ops.len() as u32 >= limit {
                break;
            }
        }

        Ok(DownloadResponse {
            ops,
            max_server_seq: doc.sync_version as i64,
        })
    }

    async fn user_sync_state(&self) -> Result<i64> {
        let (_, doc) = self.read_document().await?;
        Ok(doc.sync_version as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalFileBackend;
    use opsync_core::{OpType, VectorClock};

    fn client(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn op(client_id: &str, seq: u64) -> Operation {
        let vc = {
            let mut vc = VectorClock::new();
            let id = client(client_id);
            for _ in 0..seq {
                vc = vc.increment(&id);
            }
            vc
        };
        Operation {
            id: uuid::Uuid::now_v7().to_string(),
            client_id: client(client_id),
            op_type: OpType::Upd,
            entity_type: "task".into(),
            entity_id: Some("t1".into()),
            payload: serde_json::json!({"n": seq}),
            vector_clock: vc,
            timestamp_ms: seq as i64,
            schema_version: 1,
            reason: None,
        }
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("doc.json"));
        let transport = FileAdapterTransport::new(backend, "account-1");
        let a = client("device-a");

        let response = transport
            .upload(&a, vec![op("device-a", 1), op("device-a", 2)])
            .await
            .unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results.iter().all(|r| r.accepted));

        let state = transport.user_sync_state().await.unwrap();
        assert_eq!(state, 2);

        let page = transport.download(0, 10).await.unwrap();
        assert_eq!(page.ops.len(), 2);
        assert_eq!(page.max_server_seq, 2);
        assert_eq!(page.ops[0].server_seq, 1);
        assert_eq!(page.ops[1].server_seq, 2);
    }

    #[tokio::test]
    async fn download_respects_since_seq_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("doc.json"));
        let transport = FileAdapterTransport::new(backend, "account-1");
        let a = client("device-a");

        transport
            .upload(
                &a,
                vec![op("device-a", 1), op("device-a", 2), op("device-a", 3)],
            )
            .await
            .unwrap();

        let page = transport.download(1, 1).await.unwrap();
        assert_eq!(page.ops.len(), 1);
        assert_eq!(page.ops[0].server_seq, 2);
    }

    #[tokio::test]
    async fn recent_ops_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("doc.json"));
        let transport = FileAdapterTransport::new(backend, "account-1");
        let a = client("device-a");

        let many: Vec<Operation> = (1..=(FILE_ADAPTER_RECENT_OPS_CAP as u64 + 10))
            .map(|i| op("device-a", i))
            .collect();
        transport.upload(&a, many).await.unwrap();

        let page = transport.download(0, 10_000).await.unwrap();
        assert_eq!(page.ops.len(), FILE_ADAPTER_RECENT_OPS_CAP);
        assert_eq!(page.max_server_seq, FILE_ADAPTER_RECENT_OPS_CAP as i64 + 10);
    }
}
