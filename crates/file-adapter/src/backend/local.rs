//! A local-filesystem [`FileBackend`], for a synced folder (Dropbox,
//! syncthing, a network share) rather than a WebDAV endpoint.

use async_trait::async_trait;
use std::path::PathBuf;

use super::FileBackend;
use crate::error::Result;

pub struct LocalFileBackend {
    path: PathBuf,
}

impl LocalFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_current(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl FileBackend for LocalFileBackend {
    async fn read(&self) -> Result<Option<Vec<u8>>> {
        self.read_current().await
    }

    async fn compare_and_write(
        &self,
        expected_bytes: Option<&[u8]>,
        new_bytes: Vec<u8>,
    ) -> Result<bool> {
        let current = self.read_current().await?;
        if current.as_deref() != expected_bytes {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename, so a crash mid-write
        // never leaves a truncated document in place.
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &new_bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(true)
    }
}
