#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wifitop::config::{BlockSpec, EngineConfig};
use wifitop::speedtest::{
    DownloadTransport, EventStream, LatencyTransport, TransferEvent, UploadTransport,
};

pub const MB: u64 = 1_000_000;

/// How a simulated link behaves for every transfer on it.
#[derive(Debug, Clone, Copy)]
pub enum Link {
    /// `chunk` bytes every `every_ms`.
    Rate { chunk: u64, every_ms: u64 },
    Fail,
    /// Accepts the transfer and never moves a byte.
    Hang,
}

impl Link {
    /// 200 Mbps in 1 MB chunks.
    pub fn fast() -> Self {
        Link::Rate {
            chunk: MB,
            every_ms: 40,
        }
    }

    /// 32 Mbps in 1 MB chunks.
    pub fn slow() -> Self {
        Link::Rate {
            chunk: MB,
            every_ms: 250,
        }
    }

    fn events(self, total: u64) -> Result<EventStream> {
        match self {
            Link::Rate { chunk, every_ms } => Ok(paced(total, chunk, every_ms)),
            Link::Fail => anyhow::bail!("503 Service Unavailable"),
            Link::Hang => Ok(stream::pending().boxed()),
        }
    }
}

fn paced(total: u64, chunk: u64, every_ms: u64) -> EventStream {
    stream::unfold(0u64, move |sent| async move {
        if sent >= total {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(every_ms)).await;
        let sent = (sent + chunk).min(total);
        Some((Ok(TransferEvent::now(sent)), sent))
    })
    .boxed()
}

/// Deterministic stand-in for the network. Timing only works under
/// `#[tokio::test(start_paused = true)]`.
#[derive(Debug, Clone)]
pub struct MockNetwork {
    /// `None` fails every probe.
    pub latency_ms: Option<u64>,
    pub download: Link,
    pub upload: Link,
    pub probes: Arc<AtomicUsize>,
    pub transfers: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new(latency_ms: Option<u64>, download: Link, upload: Link) -> Self {
        Self {
            latency_ms,
            download,
            upload,
            probes: Arc::new(AtomicUsize::new(0)),
            transfers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn healthy() -> Self {
        Self::new(Some(12), Link::fast(), Link::slow())
    }
}

impl LatencyTransport for MockNetwork {
    async fn probe(&self, _endpoint: &str) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.latency_ms {
            Some(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            None => anyhow::bail!("connection reset by peer"),
        }
    }
}

impl DownloadTransport for MockNetwork {
    async fn download(&self, _endpoint: &str, bytes: u64) -> Result<EventStream> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.download.events(bytes)
    }
}

impl UploadTransport for MockNetwork {
    async fn upload(&self, _endpoint: &str, payload: Bytes) -> Result<EventStream> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.upload.events(payload.len() as u64)
    }
}

/// Default tunables with mock endpoints and a small upload schedule, so the
/// random upload payload stays cheap to generate.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.latency.endpoints = vec!["mock://ping".to_string()];
    config.download.endpoint = "mock://down".to_string();
    config.upload.endpoint = "mock://up".to_string();
    config.upload.blocks = vec![
        BlockSpec::new(10 * MB, 30_000),
        BlockSpec::new(15 * MB, 45_000),
        BlockSpec::new(20 * MB, 60_000),
    ];
    config
}
