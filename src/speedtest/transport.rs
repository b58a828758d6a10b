//! Network capabilities the engine consumes. [`HttpTransport`] is the
//! reqwest-backed implementation.

use anyhow::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Cumulative progress of one transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferEvent {
    pub bytes: u64,
    pub at: Instant,
}

impl TransferEvent {
    pub fn new(bytes: u64, at: Instant) -> Self {
        Self { bytes, at }
    }

    pub fn now(bytes: u64) -> Self {
        Self::new(bytes, Instant::now())
    }
}

/// Progress events of a running transfer. The stream ends when the transfer
/// completes; an `Err` item means it failed. Dropping the stream cancels it.
pub type EventStream = BoxStream<'static, Result<TransferEvent>>;

pub trait LatencyTransport: Send + Sync {
    /// One round trip to `endpoint`, resolving once the response has been
    /// fully received.
    fn probe(&self, endpoint: &str) -> impl Future<Output = Result<()>> + Send;
}

pub trait DownloadTransport: Send + Sync {
    /// Starts streaming `bytes` bytes from `endpoint`.
    fn download(&self, endpoint: &str, bytes: u64)
        -> impl Future<Output = Result<EventStream>> + Send;
}

pub trait UploadTransport: Send + Sync {
    /// Starts sending `payload` to `endpoint`.
    fn upload(&self, endpoint: &str, payload: Bytes)
        -> impl Future<Output = Result<EventStream>> + Send;
}

/// HTTP transport against a `__down?bytes=N` / `__up` endpoint pair.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    pub(crate) client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        // Per-request deadlines are owned by the engine, so only connecting
        // is bounded here.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}
