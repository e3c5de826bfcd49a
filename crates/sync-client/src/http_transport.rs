//! `reqwest`-backed [`SyncTransport`] talking to an `apps/server` instance
//! over the REST surface from §6. Retries transient failures with bounded
//! exponential backoff, per the "transient network errors are retried, never
//! surfaced" rule; everything else (auth, conflict, quota) is returned to
//! the engine untouched so it can make the call on what to do.

use crate::transport::SyncTransport;
use async_trait::async_trait;
use opsync_core::wire::{
    DownloadRequest, DownloadResponse, UploadRequest, UploadResponse, UserSyncStateResponse,
};
use opsync_core::{ClientId, Operation};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

const MAX_RETRIES: u32 = 4;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

pub struct HttpSyncTransport {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpSyncTransport {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            bearer_token,
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Retries only on connection/timeout failures and 5xx; 4xx responses
    /// (auth, validation, conflict bodies the caller must inspect) return
    /// immediately.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HttpTransportError> {
        let mut attempt = 0;
        loop {
            let result = build().send().await;
            match result {
                Ok(response) if response.status().is_server_error() => {
                    if attempt >= MAX_RETRIES {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpTransportError::Status { status, body });
                    }
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if attempt >= MAX_RETRIES {
                        return Err(HttpTransportError::Request(err));
                    }
                }
                Err(err) => return Err(HttpTransportError::Request(err)),
            }
            tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }

    async fn parse_ok<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HttpTransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpTransportError::Status { status, body });
        }
        response
            .json::<T>()
            .await
            .map_err(HttpTransportError::Request)
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    type Error = HttpTransportError;

    async fn upload(
        &self,
        client_id: &ClientId,
        ops: Vec<Operation>,
    ) -> Result<UploadResponse, Self::Error> {
        let url = format!("{}/sync/upload", self.base_url);
        let body = UploadRequest {
            client_id: client_id.clone(),
            ops,
        };
        let response = self
            .send_with_retry(|| self.with_auth(self.client.post(&url)).json(&body))
            .await?;
        Self::parse_ok(response).await
    }

    async fn download(
        &self,
        since_seq: i64,
        limit: u32,
    ) -> Result<DownloadResponse, Self::Error> {
        let url = format!("{}/sync/download", self.base_url);
        let query = DownloadRequest { since_seq, limit };
        let response = self
            .send_with_retry(|| self.with_auth(self.client.get(&url)).query(&query))
            .await?;
        Self::parse_ok(response).await
    }

    async fn user_sync_state(&self) -> Result<i64, Self::Error> {
        let url = format!("{}/sync/state", self.base_url);
        let response = self
            .send_with_retry(|| self.with_auth(self.client.get(&url)))
            .await?;
        let parsed: UserSyncStateResponse = Self::parse_ok(response).await?;
        Ok(parsed.max_server_seq)
    }
}
