//! A WebDAV-backed [`FileBackend`], talking to a remote share over `reqwest`
//! (the same HTTP client the teacher's `device-sync` crate and
//! `sync-client::http_transport` both use).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::FileBackend;
use crate::error::{FileAdapterError, Result};

pub struct WebdavFileBackend {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl WebdavFileBackend {
    pub fn new(url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            bearer_token,
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl FileBackend for WebdavFileBackend {
    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let response = self
            .with_auth(self.client.get(&self.url))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FileAdapterError::HttpStatus { status, body });
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// No server-side ETag negotiation: re-reads the document right before
    /// the `PUT` and compares its bytes against `expected_bytes`. This
    /// narrows, but does not eliminate, the race between two writers; the
    /// document format carries its own `syncVersion` so a lost race is
    /// detected and retried one layer up rather than silently corrupting
    /// state.
    async fn compare_and_write(
        &self,
        expected_bytes: Option<&[u8]>,
        new_bytes: Vec<u8>,
    ) -> Result<bool> {
        let current = self.read().await?;
        if current.as_deref() != expected_bytes {
            return Ok(false);
        }

        let response = self
            .with_auth(self.client.put(&self.url))
            .body(new_bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FileAdapterError::HttpStatus { status, body });
        }
        Ok(true)
    }
}
