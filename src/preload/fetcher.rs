//! Streamed audio downloads.
//!
//! The [`AudioFetcher`] trait is the seam between the preloader and the
//! network. [`HttpFetcher`] streams a response body chunk by chunk with
//! progress reporting and stops at the next chunk boundary when cancelled.
//! Bodies larger than the fetcher's byte limit are refused.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PlayerError, Result};

/// Progress callback: `(received_bytes, total_bytes)`.
///
/// `total_bytes` is None when the server sent no content length.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Outcome of probing a URL that stalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered with a success status; the load is just slow.
    Reachable,
    /// The URL is expired or gone (403 / 404).
    Stale(u16),
    /// The request failed or was refused.
    Unreachable(String),
}

/// Downloads audio bytes.
pub trait AudioFetcher: Send + Sync {
    /// Fetches `url` completely, reporting progress after every chunk.
    fn fetch(
        &self,
        url: &str,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Bytes>>;

    /// Sends a lightweight request to classify a stalled URL.
    fn probe(&self, url: &str) -> BoxFuture<'_, ProbeOutcome>;
}

/// Largest body buffered when no other limit is configured.
pub const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::with_client(reqwest::Client::new())
    }
}

impl HttpFetcher {
    /// Creates a fetcher with a fresh client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fetcher sharing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Sets the largest body this fetcher will buffer.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self, bytes: u64) -> PlayerError {
        PlayerError::network(format!(
            "response of {} bytes exceeds the {} byte limit",
            bytes, self.max_bytes
        ))
    }

    async fn fetch_inner(
        &self,
        url: String,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PlayerError::cancelled("download")),
            response = self.client.get(&url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let total = response.content_length();
        if let Some(total) = total {
            if total > self.max_bytes {
                return Err(self.too_large(total));
            }
        }
        let capacity = total.unwrap_or(0).min(self.max_bytes);
        let mut buffer = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PlayerError::cancelled("download")),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > self.max_bytes {
                return Err(self.too_large(received));
            }
            buffer.extend_from_slice(&chunk);
            if let Some(progress) = &progress {
                progress(received, total);
            }
        }

        debug!(bytes = received, "download complete");
        Ok(buffer.freeze())
    }

    async fn probe_inner(&self, url: String) -> ProbeOutcome {
        match self.client.head(&url).send().await {
            Ok(response) => classify_probe_status(response.status()),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

impl AudioFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.fetch_inner(url.to_string(), progress, cancel))
    }

    fn probe(&self, url: &str) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(self.probe_inner(url.to_string()))
    }
}

/// Maps a non-success response status to an error.
pub fn status_error(status: StatusCode) -> PlayerError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => PlayerError::stale_url(status.as_u16()),
        _ => PlayerError::network(format!("HTTP {}", status)),
    }
}

/// Classifies the status of a HEAD probe.
pub fn classify_probe_status(status: StatusCode) -> ProbeOutcome {
    if status.is_success() {
        ProbeOutcome::Reachable
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
        ProbeOutcome::Stale(status.as_u16())
    } else {
        ProbeOutcome::Unreachable(format!("HTTP {}", status))
    }
}
