use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CLOUDFLARE: &str = "https://speed.cloudflare.com";

const MB: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Every tunable the engine reads. Missing TOML keys fall back to the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub latency: LatencyConfig,
    pub download: DirectionConfig,
    pub upload: DirectionConfig,
    pub stabilization: StabilizationConfig,
    pub aggregate: AggregateConfig,
    pub upload_failure: UploadFailurePolicy,
    /// Per-direction wall-clock budget; no new block starts once it is spent.
    pub time_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latency: LatencyConfig::default(),
            download: DirectionConfig::download(),
            upload: DirectionConfig::upload(),
            stabilization: StabilizationConfig::default(),
            aggregate: AggregateConfig::default(),
            upload_failure: UploadFailurePolicy::Abort,
            time_budget_ms: 240_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.latency.probe_count == 0 {
            return invalid("latency.probe_count must be at least 1");
        }
        if self.latency.endpoints.is_empty() {
            return invalid("latency.endpoints must not be empty");
        }
        if self.latency.concurrency == 0 {
            return invalid("latency.concurrency must be at least 1");
        }
        if !self.latency.tolerance_ratio.is_finite() || self.latency.tolerance_ratio < 1.0 {
            return invalid("latency.tolerance_ratio must be >= 1.0");
        }
        if !self.latency.fallback_ms.is_finite() || self.latency.fallback_ms <= 0.0 {
            return invalid("latency.fallback_ms must be positive");
        }
        for (name, direction) in [("download", &self.download), ("upload", &self.upload)] {
            if direction.blocks.is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.blocks must not be empty")));
            }
            if direction.blocks.iter().any(|b| b.bytes == 0 || b.timeout_ms == 0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.blocks entries need non-zero bytes and timeout_ms"
                )));
            }
            if !direction.consistency_tolerance_pct.is_finite() || direction.consistency_tolerance_pct < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.consistency_tolerance_pct must be a non-negative number"
                )));
            }
            if direction.sample_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.sample_interval_ms must be positive"
                )));
            }
        }
        if self.stabilization.window < 2 {
            return invalid("stabilization.window must be at least 2");
        }
        let variance = self.stabilization.variance_tolerance_pct;
        if !variance.is_finite() || variance <= 0.0 {
            return invalid("stabilization.variance_tolerance_pct must be positive");
        }
        if self.stabilization.required_stable_samples == 0 {
            return invalid("stabilization.required_stable_samples must be at least 1");
        }
        if let UploadFailurePolicy::EstimateFromDownload { ratio } = self.upload_failure {
            if !ratio.is_finite() || ratio <= 0.0 {
                return invalid("upload_failure.ratio must be positive");
            }
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Probe targets, used round-robin.
    pub endpoints: Vec<String>,
    pub probe_count: usize,
    /// Probes sent and discarded before counting starts.
    pub warmup_probes: usize,
    /// Maximum probes in flight at once.
    pub concurrency: usize,
    pub probe_timeout_ms: u64,
    pub max_plausible_ms: f64,
    pub min_valid_probes: usize,
    /// Samples above `min * tolerance_ratio` are left out of the estimate.
    pub tolerance_ratio: f64,
    pub fallback_ms: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                format!("{CLOUDFLARE}/__down?bytes=0"),
                "https://1.1.1.1/cdn-cgi/trace".to_string(),
            ],
            probe_count: 20,
            warmup_probes: 1,
            concurrency: 1,
            probe_timeout_ms: 3_000,
            max_plausible_ms: 5_000.0,
            min_valid_probes: 3,
            tolerance_ratio: 1.3,
            fallback_ms: 20.0,
        }
    }
}

impl LatencyConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub bytes: u64,
    pub timeout_ms: u64,
}

impl BlockSpec {
    pub fn new(bytes: u64, timeout_ms: u64) -> Self {
        Self { bytes, timeout_ms }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Schedule and sampling knobs for one transfer direction.
///
/// A `[download]` or `[upload]` table must name its `endpoint`, `blocks`
/// and `consistency_tolerance_pct`; the sampling fields are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionConfig {
    pub endpoint: String,
    pub blocks: Vec<BlockSpec>,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// No instantaneous sample is taken before this much of a block elapsed.
    #[serde(default = "default_sample_warmup_ms")]
    pub sample_warmup_ms: u64,
    #[serde(default = "default_min_block_duration_ms")]
    pub min_block_duration_ms: u64,
    /// Two consecutive blocks within this percentage end the schedule.
    pub consistency_tolerance_pct: f64,
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_sample_warmup_ms() -> u64 {
    2_000
}

fn default_min_block_duration_ms() -> u64 {
    2_000
}

impl DirectionConfig {
    pub fn download() -> Self {
        Self {
            endpoint: format!("{CLOUDFLARE}/__down"),
            blocks: vec![
                BlockSpec::new(100 * MB, 60_000),
                BlockSpec::new(150 * MB, 90_000),
                BlockSpec::new(200 * MB, 120_000),
            ],
            sample_interval_ms: default_sample_interval_ms(),
            sample_warmup_ms: default_sample_warmup_ms(),
            min_block_duration_ms: default_min_block_duration_ms(),
            consistency_tolerance_pct: 15.0,
        }
    }

    pub fn upload() -> Self {
        Self {
            endpoint: format!("{CLOUDFLARE}/__up"),
            blocks: vec![
                BlockSpec::new(50 * MB, 60_000),
                BlockSpec::new(75 * MB, 90_000),
                BlockSpec::new(100 * MB, 120_000),
            ],
            consistency_tolerance_pct: 20.0,
            ..Self::download()
        }
    }

    /// Builds a three block schedule of `first`, 1.5x and 2x, with timeouts
    /// scaled the same way.
    pub fn with_scaled_blocks(mut self, first_bytes: u64, first_timeout_ms: u64) -> Self {
        self.blocks = [2, 3, 4]
            .iter()
            .map(|half| BlockSpec::new(first_bytes * half / 2, first_timeout_ms * half / 2))
            .collect();
        self
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sample_warmup(&self) -> Duration {
        Duration::from_millis(self.sample_warmup_ms)
    }

    pub fn min_block_duration(&self) -> Duration {
        Duration::from_millis(self.min_block_duration_ms)
    }

    pub fn largest_block(&self) -> u64 {
        self.blocks.iter().map(|b| b.bytes).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub window: usize,
    pub variance_tolerance_pct: f64,
    pub required_stable_samples: usize,
    pub min_elapsed_ms: u64,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            window: 5,
            variance_tolerance_pct: 5.0,
            required_stable_samples: 15,
            min_elapsed_ms: 15_000,
        }
    }
}

impl StabilizationConfig {
    pub fn min_elapsed(&self) -> Duration {
        Duration::from_millis(self.min_elapsed_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub variability_weight: f64,
    pub jitter_penalty_per_ms: f64,
    pub max_jitter_penalty: f64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            variability_weight: 0.3,
            jitter_penalty_per_ms: 0.5,
            max_jitter_penalty: 10.0,
        }
    }
}

/// What happens when every upload block fails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum UploadFailurePolicy {
    /// The whole test fails with an upload error.
    #[default]
    Abort,
    /// Upload is reported as `download * ratio` and flagged as estimated.
    EstimateFromDownload { ratio: f64 },
}
