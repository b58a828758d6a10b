//! Progress reporting. Observers are called inline and must not block.

use super::TestPhase;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Overall completion, 0 to 100, never decreasing within one run.
    pub percent: f64,
    pub status: String,
    pub detail: ProgressDetail,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressDetail {
    pub phase: TestPhase,
    /// Latest reading for the phase: milliseconds while pinging, Mbps while
    /// transferring.
    pub current_speed: Option<f64>,
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &Progress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn on_progress(&self, progress: &Progress) {
        self(progress)
    }
}

impl ProgressObserver for mpsc::UnboundedSender<Progress> {
    fn on_progress(&self, progress: &Progress) {
        let _ = self.send(progress.clone());
    }
}

impl ProgressObserver for mpsc::Sender<Progress> {
    fn on_progress(&self, progress: &Progress) {
        // A full channel drops the update rather than stalling a measurement.
        let _ = self.try_send(progress.clone());
    }
}

pub struct Silent;

impl ProgressObserver for Silent {
    fn on_progress(&self, _progress: &Progress) {}
}

/// Per-run wrapper that keeps percentages and phases moving forward only.
pub struct ProgressReporter<'a> {
    observer: &'a dyn ProgressObserver,
    percent: f64,
    phase: TestPhase,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(observer: &'a dyn ProgressObserver) -> Self {
        Self {
            observer,
            percent: 0.0,
            phase: TestPhase::Idle,
        }
    }

    pub fn report(
        &mut self,
        percent: f64,
        status: impl Into<String>,
        phase: TestPhase,
        current_speed: Option<f64>,
    ) {
        if phase < self.phase {
            tracing::debug!(?phase, current = ?self.phase, "dropping out-of-order progress");
            return;
        }
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            self.percent
        };
        self.percent = self.percent.max(percent);
        self.phase = phase;

        self.observer.on_progress(&Progress {
            percent: self.percent,
            status: status.into(),
            detail: ProgressDetail {
                phase,
                current_speed,
            },
        });
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn phase(&self) -> TestPhase {
        self.phase
    }
}
