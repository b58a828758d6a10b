pub mod aggregate;
pub mod cancel;
pub mod download;
pub mod error;
pub mod ping;
pub mod progress;
pub mod stabilization;
pub mod stats;
pub mod throughput;
pub mod transport;
pub mod upload;

pub use aggregate::{ConnectionType, Precision, SpeedCategory, SpeedTestResult};
pub use cancel::{CancelHandle, CancelToken};
pub use error::SpeedTestError;
pub use progress::{Progress, ProgressDetail, ProgressObserver, Silent};
pub use transport::{
    DownloadTransport, EventStream, HttpTransport, LatencyTransport, TransferEvent,
    UploadTransport,
};

use crate::config::{EngineConfig, UploadFailurePolicy};
use aggregate::DirectionSummary;
use download::DownloadPrimitive;
use progress::ProgressReporter;
use serde::Serialize;
use std::fmt;
use throughput::{SampleTick, ThroughputSampler};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use upload::UploadPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestPhase {
    Idle,
    Ping,
    Download,
    Upload,
    Complete,
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestPhase::Idle => "idle",
            TestPhase::Ping => "ping",
            TestPhase::Download => "download",
            TestPhase::Upload => "upload",
            TestPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn phase(&self) -> TestPhase {
        match self {
            Direction::Download => TestPhase::Download,
            Direction::Upload => TestPhase::Upload,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.phase().fmt(f)
    }
}

// Overall progress allotted to each phase.
const PING_END: f64 = 10.0;
const DOWNLOAD_END: f64 = 55.0;
const UPLOAD_END: f64 = 98.0;

fn within(start: f64, end: f64, fraction: f64) -> f64 {
    start + (end - start) * fraction.clamp(0.0, 1.0)
}

/// One configured speed test: latency, then download, then upload.
///
/// The engine owns its transports and a [`CancelHandle`]. Once cancelled it
/// stays cancelled, so build a new engine per run that may be cancelled.
pub struct SpeedTest<L, D, U> {
    config: EngineConfig,
    latency: L,
    download: D,
    upload: U,
    cancel: CancelHandle,
}

impl<T> SpeedTest<T, T, T>
where
    T: LatencyTransport + DownloadTransport + UploadTransport + Clone,
{
    /// Uses one transport for every phase.
    pub fn with_transport(config: EngineConfig, transport: T) -> Result<Self, SpeedTestError> {
        Self::new(config, transport.clone(), transport.clone(), transport)
    }
}

impl<L, D, U> SpeedTest<L, D, U>
where
    L: LatencyTransport,
    D: DownloadTransport,
    U: UploadTransport,
{
    pub fn new(config: EngineConfig, latency: L, download: D, upload: U) -> Result<Self, SpeedTestError> {
        config.validate()?;
        Ok(Self {
            config,
            latency,
            download,
            upload,
            cancel: CancelHandle::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs every phase, reporting progress to `observer`, and resolves with
    /// the full result or a single phase-attributed error.
    pub async fn run(&self, observer: &dyn ProgressObserver) -> Result<SpeedTestResult, SpeedTestError> {
        self.execute(observer).instrument(info_span!("speedtest")).await
    }

    async fn execute(&self, observer: &dyn ProgressObserver) -> Result<SpeedTestResult, SpeedTestError> {
        let started = Instant::now();
        let token = self.cancel.token();
        let mut reporter = ProgressReporter::new(observer);

        reporter.report(0.0, "Measuring latency...", TestPhase::Ping, None);
        let latency = ping::probe_latency(&self.latency, &self.config.latency, &token, |tick| {
            let done = (tick.index + 1) as f64 / tick.total.max(1) as f64;
            reporter.report(
                within(0.0, PING_END, done),
                format!("Measuring latency... {}/{}", tick.index + 1, tick.total),
                TestPhase::Ping,
                tick.latency_ms,
            );
        })
        .await;
        if token.is_cancelled() {
            return Err(SpeedTestError::Cancelled {
                phase: TestPhase::Ping,
            });
        }

        reporter.report(
            PING_END,
            "Measuring download speed...",
            TestPhase::Download,
            None,
        );
        let download = self.measure_download(&token, &mut reporter).await?;

        reporter.report(
            DOWNLOAD_END,
            "Measuring upload speed...",
            TestPhase::Upload,
            None,
        );
        let upload = self.measure_upload(&token, &mut reporter, &download).await?;

        let elapsed = started.elapsed();
        let result = aggregate::aggregate(
            &latency,
            &download,
            &upload,
            &self.config.aggregate,
            elapsed,
        );
        info!(
            download_mbps = result.download_speed,
            upload_mbps = result.upload_speed,
            ping_ms = result.ping,
            jitter_ms = result.jitter,
            stability = result.stability,
            upload_estimated = result.upload_estimated,
            "speed test complete"
        );
        reporter.report(
            100.0,
            format!("Test completed in {:.1}s", elapsed.as_secs_f64()),
            TestPhase::Complete,
            None,
        );
        Ok(result)
    }

    async fn measure_download(
        &self,
        token: &CancelToken,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<DirectionSummary, SpeedTestError> {
        let config = &self.config.download;
        let sampler = ThroughputSampler::new(
            Direction::Download,
            config,
            &self.config.stabilization,
            self.config.time_budget(),
            token,
        );
        let primitive = DownloadPrimitive::new(&self.download, &config.endpoint);
        let measurement = sampler
            .measure(&primitive, |tick| {
                report_sample(reporter, PING_END, DOWNLOAD_END, &tick)
            })
            .await;

        // Upload has not run yet, so a cancelled download is never a result.
        if measurement.cancelled {
            return Err(SpeedTestError::Cancelled {
                phase: TestPhase::Download,
            });
        }
        DirectionSummary::measured(&measurement).ok_or_else(|| SpeedTestError::Download {
            reason: measurement.failure_summary(),
        })
    }

    async fn measure_upload(
        &self,
        token: &CancelToken,
        reporter: &mut ProgressReporter<'_>,
        download: &DirectionSummary,
    ) -> Result<DirectionSummary, SpeedTestError> {
        let config = &self.config.upload;
        let payload_len = usize::try_from(config.largest_block()).unwrap_or(usize::MAX);
        let payload = match upload::random_payload(payload_len).await {
            Ok(payload) => payload,
            Err(e) => return self.upload_failed(format!("payload generation: {e:#}"), download),
        };

        let sampler = ThroughputSampler::new(
            Direction::Upload,
            config,
            &self.config.stabilization,
            self.config.time_budget(),
            token,
        );
        let primitive = UploadPrimitive::new(&self.upload, &config.endpoint, payload);
        let measurement = sampler
            .measure(&primitive, |tick| {
                report_sample(reporter, DOWNLOAD_END, UPLOAD_END, &tick)
            })
            .await;

        match DirectionSummary::measured(&measurement) {
            Some(summary) => {
                if measurement.cancelled {
                    info!(blocks = summary.samples.len(), "cancelled, keeping finished upload blocks");
                }
                Ok(summary)
            }
            None if measurement.cancelled => Err(SpeedTestError::Cancelled {
                phase: TestPhase::Upload,
            }),
            None => self.upload_failed(measurement.failure_summary(), download),
        }
    }

    fn upload_failed(
        &self,
        reason: String,
        download: &DirectionSummary,
    ) -> Result<DirectionSummary, SpeedTestError> {
        match self.config.upload_failure {
            UploadFailurePolicy::Abort => Err(SpeedTestError::Upload { reason }),
            UploadFailurePolicy::EstimateFromDownload { ratio } => {
                let estimate = download.speed * ratio;
                warn!(%reason, ratio, estimate, "upload failed, estimating from download");
                Ok(DirectionSummary::estimated(estimate))
            }
        }
    }
}

fn report_sample(reporter: &mut ProgressReporter<'_>, start: f64, end: f64, tick: &SampleTick) {
    let direction = tick.sample.direction;
    let status = match direction {
        Direction::Download => format!("Download: {:.1} Mbps", tick.sample.mbps),
        Direction::Upload => format!("Upload: {:.1} Mbps", tick.sample.mbps),
    };
    reporter.report(
        within(start, end, tick.schedule_fraction()),
        status,
        direction.phase(),
        Some(tick.sample.mbps),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(TestPhase::Idle < TestPhase::Ping);
        assert!(TestPhase::Ping < TestPhase::Download);
        assert!(TestPhase::Download < TestPhase::Upload);
        assert!(TestPhase::Upload < TestPhase::Complete);
        assert_eq!(Direction::Upload.to_string(), "upload");
    }

    #[test]
    fn test_within_clamps_fraction() {
        assert_eq!(within(10.0, 55.0, 0.0), 10.0);
        assert_eq!(within(10.0, 55.0, 1.0), 55.0);
        assert_eq!(within(10.0, 55.0, 2.0), 55.0);
        assert_eq!(within(55.0, 98.0, 0.5), 76.5);
    }
}
