use super::throughput::TransferPrimitive;
use super::transport::{EventStream, HttpTransport, TransferEvent, UploadTransport};
use anyhow::Result;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{stream, Stream, StreamExt};
use rand::{RngCore, SeedableRng};
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 64 * 1024;

/// Random bytes, so no compression on the path can inflate the result.
pub async fn random_payload(len: usize) -> Result<Bytes> {
    let data = tokio::task::spawn_blocking(move || {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    })
    .await?;
    Ok(Bytes::from(data))
}

/// Adapts an [`UploadTransport`] to the sampler. Every block sends a prefix
/// of one shared payload.
pub struct UploadPrimitive<'a, T> {
    transport: &'a T,
    endpoint: &'a str,
    payload: Bytes,
}

impl<'a, T: UploadTransport> UploadPrimitive<'a, T> {
    pub fn new(transport: &'a T, endpoint: &'a str, payload: Bytes) -> Self {
        Self {
            transport,
            endpoint,
            payload,
        }
    }
}

impl<T: UploadTransport> TransferPrimitive for UploadPrimitive<'_, T> {
    async fn start(&self, bytes: u64) -> Result<EventStream> {
        let len = usize::try_from(bytes).unwrap_or(usize::MAX).min(self.payload.len());
        self.transport
            .upload(self.endpoint, self.payload.slice(..len))
            .await
    }
}

fn chunked(payload: &Bytes) -> Vec<Bytes> {
    (0..payload.len())
        .step_by(CHUNK_SIZE)
        .map(|offset| payload.slice(offset..(offset + CHUNK_SIZE).min(payload.len())))
        .collect()
}

impl UploadTransport for HttpTransport {
    async fn upload(&self, endpoint: &str, payload: Bytes) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();

        // Progress is the amount handed to the connection so far.
        let progress = tx.clone();
        let mut sent: u64 = 0;
        let body = stream::iter(chunked(&payload)).map(move |chunk| {
            sent += chunk.len() as u64;
            let _ = progress.unbounded_send(Ok(TransferEvent::now(sent)));
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body));

        let task = tokio::spawn(async move {
            let result = async {
                request.send().await?.error_for_status()?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            if let Err(e) = result {
                let _ = tx.unbounded_send(Err(e));
            }
        });

        Ok(UploadEvents { rx, task }.boxed())
    }
}

/// Progress of a request running on its own task. The stream ends once the
/// server has answered; dropping it aborts the request.
struct UploadEvents {
    rx: mpsc::UnboundedReceiver<Result<TransferEvent>>,
    task: JoinHandle<()>,
}

impl Stream for UploadEvents {
    type Item = Result<TransferEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for UploadEvents {
    fn drop(&mut self) {
        self.task.abort();
    }
}
