//! Plateau detection over instantaneous speed readings of one block.

use super::stats;
use crate::config::StabilizationConfig;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizationState {
    /// The window is not full yet.
    RampingUp,
    Accumulating,
    /// Terminal; the caller should stop the transfer.
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub stable: bool,
    /// `(max - min) / mean * 100` over the window, once it is full.
    pub variance_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StabilizationDetector {
    window: VecDeque<f64>,
    capacity: usize,
    tolerance_percent: f64,
    required_stable: usize,
    min_elapsed: Duration,
    consecutive_stable: usize,
    state: StabilizationState,
}

impl StabilizationDetector {
    pub fn new(config: &StabilizationConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window + 1),
            capacity: config.window.max(1),
            tolerance_percent: config.variance_tolerance_pct,
            required_stable: config.required_stable_samples,
            min_elapsed: config.min_elapsed(),
            consecutive_stable: 0,
            state: StabilizationState::RampingUp,
        }
    }

    /// Feeds one reading taken `elapsed` after the block started.
    pub fn observe(&mut self, mbps: f64, elapsed: Duration) -> Observation {
        if self.state == StabilizationState::Stable {
            return Observation {
                stable: true,
                variance_percent: self.variance_percent(),
            };
        }

        self.window.push_back(mbps);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }

        if self.window.len() < self.capacity {
            return Observation {
                stable: false,
                variance_percent: None,
            };
        }
        self.state = StabilizationState::Accumulating;

        let variance_percent = self.variance_percent();
        match variance_percent {
            Some(v) if v < self.tolerance_percent => self.consecutive_stable += 1,
            _ => self.consecutive_stable = 0,
        }

        if self.consecutive_stable >= self.required_stable && elapsed > self.min_elapsed {
            self.state = StabilizationState::Stable;
        }

        Observation {
            stable: self.state == StabilizationState::Stable,
            variance_percent,
        }
    }

    fn readings(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }

    fn variance_percent(&self) -> Option<f64> {
        let window = self.readings();
        let avg = stats::mean(&window)?;
        if avg <= 0.0 || !avg.is_finite() {
            return None;
        }
        let spread = stats::max(&window)? - stats::min(&window)?;
        Some(spread / avg * 100.0)
    }

    /// Mean of the current window; the block speed to report on an early stop.
    pub fn stabilized_speed(&self) -> Option<f64> {
        stats::mean(&self.readings())
    }

    pub fn state(&self) -> StabilizationState {
        self.state
    }

    pub fn consecutive_stable(&self) -> usize {
        self.consecutive_stable
    }
}
