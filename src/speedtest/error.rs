use super::TestPhase;
use crate::config::ConfigError;
use std::time::Duration;

/// Terminal failures of a speed test run. Each variant names the phase that
/// failed so callers can tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum SpeedTestError {
    #[error("download measurement failed: {reason}")]
    Download { reason: String },
    #[error("upload measurement failed: {reason}")]
    Upload { reason: String },
    #[error("speed test cancelled during {phase}")]
    Cancelled { phase: TestPhase },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SpeedTestError {
    pub fn phase(&self) -> Option<TestPhase> {
        match self {
            SpeedTestError::Download { .. } => Some(TestPhase::Download),
            SpeedTestError::Upload { .. } => Some(TestPhase::Upload),
            SpeedTestError::Cancelled { phase } => Some(*phase),
            SpeedTestError::Config(_) => None,
        }
    }
}

/// Why a single transfer block produced no usable outcome. These never
/// leave the sampler; they are logged and the schedule moves on.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BlockError {
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("finished in {0:?}, below the minimum block duration")]
    TooFast(Duration),
    #[error("transfer ended after {got} of {expected} bytes")]
    ShortTransfer { expected: u64, got: u64 },
    #[error("no usable throughput")]
    Empty,
    #[error("cancelled")]
    Cancelled,
}
