//! HTTP transport for transfers and latency probes
//!
//! One `TransferBackend` call is one transfer: the orchestrator's worker
//! pool decides how many run concurrently and when to start the next one.
//! Every request carries cache-defeating decoration (a monotonically
//! distinct nonce query parameter plus no-cache headers) so intermediaries
//! cannot serve a measurement from cache.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Body, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Upload body chunk size; one progress event is reported per chunk
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Monotonic nonce shared by every request issued by this process
static TRANSFER_NONCE: AtomicU64 = AtomicU64::new(0);

/// Transport abstraction for one transfer or probe.
///
/// Byte progress is reported as deltas on an unbounded channel so counter
/// events are never dropped; a closed channel or a raised cancel flag ends
/// the transfer cooperatively (partial progress already reported stays
/// valid, there is no rollback).
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Run one download transfer to completion or cancellation.
    /// Returns the bytes received by this call.
    async fn download(
        &self,
        url: &str,
        progress: mpsc::UnboundedSender<u64>,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64>;

    /// Run one upload transfer of `payload` to completion or cancellation.
    /// The payload is shared read-only across concurrent streams and
    /// reused bit-for-bit across repeated requests. Returns the bytes
    /// handed to the transport by this call.
    async fn upload(
        &self,
        url: &str,
        payload: Bytes,
        progress: mpsc::UnboundedSender<u64>,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64>;

    /// Issue one minimal round-trip probe and return its latency in
    /// milliseconds, measured on the monotonic clock.
    async fn probe(&self, url: &str) -> Result<f64>;

    /// Fetch the caller's public-address descriptor from a lookup
    /// endpoint. Not part of any measurement phase.
    async fn fetch_ip(&self, _url: &str) -> Result<String> {
        Err(AppError::unmeasured("ip lookup not supported by this transport"))
    }
}

/// `TransferBackend` over a shared reqwest client
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    /// Create a backend whose individual requests time out after
    /// `request_timeout` (connect through end of body).
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Append the cache-defeating nonce to a target URL
    fn decorate_url(url: &str) -> Result<url::Url> {
        let mut parsed = url::Url::parse(url)
            .map_err(|e| AppError::parse(format!("Invalid URL '{}': {}", url, e)))?;
        let nonce = TRANSFER_NONCE.fetch_add(1, Ordering::Relaxed);
        parsed.query_pairs_mut().append_pair("r", &nonce.to_string());
        Ok(parsed)
    }

    fn get_with_headers(&self, url: url::Url) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Cache-Control", "no-store, no-cache, max-age=0")
            .header("Pragma", "no-cache")
    }
}

/// Resolve once the cancel flag is raised or its sender is gone
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl TransferBackend for HttpBackend {
    async fn download(
        &self,
        url: &str,
        progress: mpsc::UnboundedSender<u64>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<u64> {
        let url = Self::decorate_url(url)?;

        let response = tokio::select! {
            _ = wait_cancelled(&mut cancel) => return Ok(0),
            response = self.get_with_headers(url).send() => response?,
        };
        let response = response.error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => break,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let len = bytes.len() as u64;
                        total += len;
                        // Receiver gone means the phase moved on
                        if progress.send(len).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }
        Ok(total)
    }

    async fn upload(
        &self,
        url: &str,
        payload: Bytes,
        progress: mpsc::UnboundedSender<u64>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<u64> {
        let url = Self::decorate_url(url)?;

        // Chunk the shared payload without copying it; progress fires as
        // the transport pulls each chunk, approximating acknowledged bytes.
        let sent = Arc::new(AtomicU64::new(0));
        let mut chunks = Vec::with_capacity(payload.len().div_ceil(UPLOAD_CHUNK_BYTES));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + UPLOAD_CHUNK_BYTES).min(payload.len());
            chunks.push(payload.slice(offset..end));
            offset = end;
        }
        let counter = Arc::clone(&sent);
        let body_stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            let _ = progress.send(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .header("Cache-Control", "no-store, no-cache, max-age=0")
            .header("Pragma", "no-cache")
            .body(Body::wrap_stream(body_stream))
            .send();

        tokio::select! {
            _ = wait_cancelled(&mut cancel) => Ok(sent.load(Ordering::Relaxed)),
            response = request => {
                response?.error_for_status()?;
                Ok(sent.load(Ordering::Relaxed))
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<f64> {
        let url = Self::decorate_url(url)?;

        let started = Instant::now();
        let response = self.get_with_headers(url).send().await?.error_for_status()?;
        // The endpoint returns a zero/near-zero body; draining it keeps the
        // measurement request-to-response-received on the monotonic clock.
        let _ = response.bytes().await?;
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }

    async fn fetch_ip(&self, url: &str) -> Result<String> {
        let url = Self::decorate_url(url)?;
        let response = self.get_with_headers(url).send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(body.trim().to_string())
    }
}
