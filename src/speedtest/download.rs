use super::throughput::TransferPrimitive;
use super::transport::{DownloadTransport, EventStream, HttpTransport, TransferEvent};
use anyhow::Result;
use futures::StreamExt;
use reqwest::header::CACHE_CONTROL;
use reqwest::RequestBuilder;

/// Adapts a [`DownloadTransport`] to the sampler for one endpoint.
pub struct DownloadPrimitive<'a, T> {
    transport: &'a T,
    endpoint: &'a str,
}

impl<'a, T: DownloadTransport> DownloadPrimitive<'a, T> {
    pub fn new(transport: &'a T, endpoint: &'a str) -> Self {
        Self { transport, endpoint }
    }
}

impl<T: DownloadTransport> TransferPrimitive for DownloadPrimitive<'_, T> {
    async fn start(&self, bytes: u64) -> Result<EventStream> {
        self.transport.download(self.endpoint, bytes).await
    }
}

impl HttpTransport {
    fn download_request(&self, endpoint: &str, bytes: u64) -> RequestBuilder {
        self.client
            .get(endpoint)
            .query(&[("bytes", bytes)])
            .header(CACHE_CONTROL, "no-store")
    }
}

impl DownloadTransport for HttpTransport {
    async fn download(&self, endpoint: &str, bytes: u64) -> Result<EventStream> {
        let response = self
            .download_request(endpoint, bytes)
            .send()
            .await?
            .error_for_status()?;

        let mut downloaded: u64 = 0;
        let events = response
            .bytes_stream()
            .map(move |chunk| -> Result<TransferEvent> {
                downloaded += chunk?.len() as u64;
                Ok(TransferEvent::now(downloaded))
            });
        Ok(events.boxed())
    }
}
