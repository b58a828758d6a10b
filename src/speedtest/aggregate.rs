use super::ping::LatencyResult;
use super::stats;
use super::throughput::DirectionMeasurement;
use crate::config::AggregateConfig;
use serde::Serialize;
use std::time::Duration;

/// Final report of one run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResult {
    pub download_speed: f64,
    pub upload_speed: f64,
    pub ping: f64,
    pub jitter: f64,
    pub min_download: f64,
    pub max_download: f64,
    pub min_upload: f64,
    pub max_upload: f64,
    pub min_ping: f64,
    pub max_ping: f64,
    /// 0 to 100; higher means steadier blocks and latency.
    pub stability: f64,
    /// Final speed of every successful block, in schedule order.
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub peak_download: f64,
    pub peak_upload: f64,
    pub connection_type: ConnectionType,
    pub is_symmetric: bool,
    pub precision: Precision,
    pub speed_category: SpeedCategory,
    /// Wall-clock seconds for the whole run.
    pub test_duration: f64,
    /// The upload figures were derived from download, not measured.
    pub upload_estimated: bool,
    pub ping_fallback: bool,
}

/// One direction reduced to its headline numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionSummary {
    pub speed: f64,
    pub min: f64,
    pub max: f64,
    pub samples: Vec<f64>,
    pub peak: f64,
    /// `(max - min) / median * 100` over block speeds; `None` when estimated.
    pub variability_pct: Option<f64>,
    pub estimated: bool,
}

impl DirectionSummary {
    /// `None` when no block of the direction succeeded.
    pub fn measured(measurement: &DirectionMeasurement) -> Option<Self> {
        let samples = measurement.speeds();
        let speed = stats::median(&samples)?;
        let min = stats::min(&samples)?;
        let max = stats::max(&samples)?;
        Some(Self {
            speed,
            min,
            max,
            peak: measurement.peak().unwrap_or(max).max(max),
            variability_pct: Some(stats::spread_percent(&samples)),
            samples,
            estimated: false,
        })
    }

    pub fn estimated(speed: f64) -> Self {
        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        Self {
            speed,
            min: speed,
            max: speed,
            samples: Vec::new(),
            peak: speed,
            variability_pct: None,
            estimated: true,
        }
    }
}

pub fn aggregate(
    latency: &LatencyResult,
    download: &DirectionSummary,
    upload: &DirectionSummary,
    config: &AggregateConfig,
    test_duration: Duration,
) -> SpeedTestResult {
    let jitter = latency.jitter_ms;
    let stability = stability_score(
        [download, upload].iter().filter_map(|d| d.variability_pct),
        jitter,
        config,
    );
    let (connection_type, is_symmetric) =
        classify_connection(download.speed, upload.speed, latency.estimate_ms, jitter);
    let sample_count = latency.raw_samples.len() + download.samples.len() + upload.samples.len();

    SpeedTestResult {
        download_speed: download.speed,
        upload_speed: upload.speed,
        ping: latency.estimate_ms,
        jitter,
        min_download: download.min,
        max_download: download.max,
        min_upload: upload.min,
        max_upload: upload.max,
        min_ping: latency.min_ms,
        max_ping: latency.max_ms,
        stability,
        download_samples: download.samples.clone(),
        upload_samples: upload.samples.clone(),
        peak_download: download.peak,
        peak_upload: upload.peak,
        connection_type,
        is_symmetric,
        precision: Precision::from_sample_count(sample_count),
        speed_category: SpeedCategory::from_mbps(download.speed),
        test_duration: test_duration.as_secs_f64(),
        upload_estimated: upload.estimated,
        ping_fallback: latency.fallback,
    }
}

/// `100 - mean(variability) * weight - min(max_penalty, jitter * per_ms)`,
/// clamped to 0..=100.
pub fn stability_score(
    variability: impl Iterator<Item = f64>,
    jitter_ms: f64,
    config: &AggregateConfig,
) -> f64 {
    let variability: Vec<f64> = variability.filter(|v| v.is_finite()).collect();
    let average = stats::mean(&variability).unwrap_or(0.0);
    let jitter_penalty = if jitter_ms.is_finite() {
        (jitter_ms.max(0.0) * config.jitter_penalty_per_ms).min(config.max_jitter_penalty)
    } else {
        config.max_jitter_penalty
    };
    let score = 100.0 - average * config.variability_weight - jitter_penalty;
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Fiber,
    Cable,
    Dsl,
    Mobile,
    Unknown,
}

impl ConnectionType {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionType::Fiber => "Fiber",
            ConnectionType::Cable => "Cable",
            ConnectionType::Dsl => "DSL",
            ConnectionType::Mobile => "Mobile",
            ConnectionType::Unknown => "Unknown",
        }
    }
}

/// Guesses the access technology from the shape of the numbers. Returns the
/// guess and whether upload is within 30% of download.
pub fn classify_connection(
    download: f64,
    upload: f64,
    ping: f64,
    jitter: f64,
) -> (ConnectionType, bool) {
    let ratio = if download > 0.0 { upload / download } else { 0.0 };
    let symmetric = (0.7..=1.3).contains(&ratio);

    let kind = if download > 100.0 && ping < 20.0 && symmetric {
        ConnectionType::Fiber
    } else if download > 100.0 && ping < 30.0 {
        if ratio < 0.3 {
            ConnectionType::Cable
        } else {
            ConnectionType::Fiber
        }
    } else if download > 30.0 && ratio < 0.5 && ping < 40.0 {
        ConnectionType::Cable
    } else if download < 50.0 && ratio < 0.3 && ping > 15.0 {
        ConnectionType::Dsl
    } else if ping > 30.0 || jitter > 10.0 {
        ConnectionType::Mobile
    } else {
        ConnectionType::Unknown
    };
    (kind, symmetric)
}

/// How much data backs the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Low,
    Medium,
    High,
}

impl Precision {
    pub fn from_sample_count(count: usize) -> Self {
        match count {
            n if n >= 10 => Precision::High,
            n if n >= 5 => Precision::Medium,
            _ => Precision::Low,
        }
    }
}

/// Variants are ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedCategory {
    Poor,
    Fair,
    Good,
    VeryGood,
    Excellent,
}

impl SpeedCategory {
    pub fn from_mbps(mbps: f64) -> Self {
        match mbps {
            m if m >= 500.0 => SpeedCategory::Excellent,
            m if m >= 100.0 => SpeedCategory::VeryGood,
            m if m >= 50.0 => SpeedCategory::Good,
            m if m >= 20.0 => SpeedCategory::Fair,
            _ => SpeedCategory::Poor,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpeedCategory::Excellent => "Excellent",
            SpeedCategory::VeryGood => "Very good",
            SpeedCategory::Good => "Good",
            SpeedCategory::Fair => "Fair",
            SpeedCategory::Poor => "Poor",
        }
    }
}
