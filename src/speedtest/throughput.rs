//! Sequential block transfers with instantaneous sampling. Blocks of one
//! direction never overlap.

use super::cancel::CancelToken;
use super::error::BlockError;
use super::stabilization::StabilizationDetector;
use super::stats;
use super::transport::EventStream;
use super::Direction;
use crate::config::{BlockSpec, DirectionConfig, StabilizationConfig};
use anyhow::Result;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Starts one transfer of a given size.
pub trait TransferPrimitive: Send + Sync {
    fn start(&self, bytes: u64) -> impl Future<Output = Result<EventStream>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub direction: Direction,
    pub elapsed: Duration,
    pub mbps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    Completed,
    /// Cut short once the readings plateaued.
    Stabilized,
    /// Ran into its timeout after enough time to still be usable.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub index: usize,
    pub requested_bytes: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub mbps: f64,
    pub samples: Vec<ThroughputSample>,
    pub end: BlockEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleTick {
    pub block_index: usize,
    pub block_count: usize,
    pub block_bytes: u64,
    pub bytes: u64,
    pub sample: ThroughputSample,
}

impl SampleTick {
    /// Fraction of the whole schedule covered so far, 0 to 1.
    pub fn schedule_fraction(&self) -> f64 {
        if self.block_count == 0 {
            return 0.0;
        }
        let within = if self.block_bytes == 0 {
            0.0
        } else {
            (self.bytes as f64 / self.block_bytes as f64).min(1.0)
        };
        ((self.block_index as f64 + within) / self.block_count as f64).min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionMeasurement {
    pub direction: Direction,
    pub blocks: Vec<TransferOutcome>,
    pub failures: Vec<String>,
    pub cancelled: bool,
}

impl DirectionMeasurement {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            blocks: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
        }
    }

    pub fn speeds(&self) -> Vec<f64> {
        self.blocks.iter().map(|b| b.mbps).collect()
    }

    /// Median block speed; `None` when no block succeeded.
    pub fn speed(&self) -> Option<f64> {
        stats::median(&self.speeds())
    }

    /// Highest reading seen, instantaneous or per block.
    pub fn peak(&self) -> Option<f64> {
        self.blocks
            .iter()
            .flat_map(|b| b.samples.iter().map(|s| s.mbps).chain(std::iter::once(b.mbps)))
            .reduce(f64::max)
    }

    pub fn failure_summary(&self) -> String {
        if self.cancelled {
            "cancelled".to_string()
        } else if self.failures.is_empty() {
            "no block completed".to_string()
        } else {
            self.failures.join("; ")
        }
    }
}

pub struct ThroughputSampler<'a> {
    direction: Direction,
    config: &'a DirectionConfig,
    stabilization: &'a StabilizationConfig,
    time_budget: Duration,
    cancel: &'a CancelToken,
}

impl<'a> ThroughputSampler<'a> {
    pub fn new(
        direction: Direction,
        config: &'a DirectionConfig,
        stabilization: &'a StabilizationConfig,
        time_budget: Duration,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            direction,
            config,
            stabilization,
            time_budget,
            cancel,
        }
    }

    /// Runs the block schedule until two consecutive blocks agree or it is
    /// stopped early.
    pub async fn measure<P, F>(&self, primitive: &P, mut on_sample: F) -> DirectionMeasurement
    where
        P: TransferPrimitive,
        F: FnMut(SampleTick) + Send,
    {
        let started = Instant::now();
        let mut measurement = DirectionMeasurement::new(self.direction);

        for (index, block) in self.config.blocks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                measurement.cancelled = true;
                break;
            }
            if started.elapsed() >= self.time_budget {
                info!(direction = %self.direction, "time budget spent, skipping remaining blocks");
                break;
            }

            let span = info_span!("block", direction = %self.direction, index, bytes = block.bytes);
            let outcome = self
                .run_block(primitive, index, block, &mut on_sample)
                .instrument(span)
                .await;

            match outcome {
                Ok(outcome) => {
                    info!(
                        direction = %self.direction,
                        index,
                        mbps = outcome.mbps,
                        bytes = outcome.bytes,
                        elapsed = ?outcome.elapsed,
                        end = ?outcome.end,
                        "block finished"
                    );
                    measurement.blocks.push(outcome);
                    if self.is_consistent(&measurement.blocks) {
                        info!(direction = %self.direction, "consecutive blocks agree, stopping schedule");
                        break;
                    }
                }
                Err(BlockError::Cancelled) => {
                    measurement.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(direction = %self.direction, index, error = %e, "block discarded");
                    let give_up = matches!(e, BlockError::TimedOut(_)) && measurement.blocks.is_empty();
                    measurement.failures.push(format!("block {}: {}", index + 1, e));
                    if give_up {
                        // Later blocks are larger and would only take longer.
                        break;
                    }
                }
            }
        }

        measurement
    }

    fn is_consistent(&self, blocks: &[TransferOutcome]) -> bool {
        match blocks {
            [.., previous, last] if previous.mbps > 0.0 => {
                let diff = (last.mbps - previous.mbps).abs() / previous.mbps * 100.0;
                diff < self.config.consistency_tolerance_pct
            }
            _ => false,
        }
    }

    async fn run_block<P, F>(
        &self,
        primitive: &P,
        index: usize,
        block: &BlockSpec,
        on_sample: &mut F,
    ) -> Result<TransferOutcome, BlockError>
    where
        P: TransferPrimitive,
        F: FnMut(SampleTick) + Send,
    {
        let start = Instant::now();
        let deadline = tokio::time::sleep(block.timeout());
        tokio::pin!(deadline);

        let mut events = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(BlockError::Cancelled),
            started = primitive.start(block.bytes) => started.map_err(BlockError::Transport)?,
            _ = &mut deadline => return Err(BlockError::TimedOut(block.timeout())),
        };

        let mut detector = StabilizationDetector::new(self.stabilization);
        let mut samples: Vec<ThroughputSample> = Vec::new();
        let mut bytes = 0u64;
        let mut last_sample: Option<Duration> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BlockError::Cancelled),
                event = events.next() => event,
                _ = &mut deadline => {
                    return self.salvage(index, block, bytes, start.elapsed(), samples);
                }
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(BlockError::Transport(e)),
                None => break,
            };
            bytes = event.bytes;

            let elapsed = event.at.saturating_duration_since(start);
            if elapsed < self.config.sample_warmup() {
                continue;
            }
            if last_sample.is_some_and(|at| elapsed < at + self.config.sample_interval()) {
                continue;
            }
            last_sample = Some(elapsed);

            let sample = ThroughputSample {
                direction: self.direction,
                elapsed,
                mbps: stats::mbps(bytes, elapsed.as_secs_f64()),
            };
            debug!(mbps = sample.mbps, ?elapsed, bytes, "sample");
            samples.push(sample);
            on_sample(SampleTick {
                block_index: index,
                block_count: self.config.blocks.len(),
                block_bytes: block.bytes,
                bytes,
                sample,
            });

            if detector.observe(sample.mbps, elapsed).stable {
                // Whole-block bytes over time would still carry the ramp-up,
                // so the plateau itself is the block speed.
                let mbps = detector.stabilized_speed().unwrap_or(sample.mbps);
                drop(events);
                return Ok(TransferOutcome {
                    index,
                    requested_bytes: block.bytes,
                    bytes,
                    elapsed,
                    mbps,
                    samples,
                    end: BlockEnd::Stabilized,
                });
            }
        }

        let elapsed = start.elapsed();
        if bytes < block.bytes / 100 * 95 {
            return Err(BlockError::ShortTransfer {
                expected: block.bytes,
                got: bytes,
            });
        }
        if elapsed < self.config.min_block_duration() {
            return Err(BlockError::TooFast(elapsed));
        }
        let mbps = stats::mbps(bytes, elapsed.as_secs_f64());
        if !mbps.is_finite() || mbps <= 0.0 {
            return Err(BlockError::Empty);
        }

        Ok(TransferOutcome {
            index,
            requested_bytes: block.bytes,
            bytes,
            elapsed,
            mbps,
            samples,
            end: BlockEnd::Completed,
        })
    }

    fn salvage(
        &self,
        index: usize,
        block: &BlockSpec,
        bytes: u64,
        elapsed: Duration,
        samples: Vec<ThroughputSample>,
    ) -> Result<TransferOutcome, BlockError> {
        let mbps = stats::mbps(bytes, elapsed.as_secs_f64());
        if samples.is_empty()
            || elapsed < self.config.min_block_duration()
            || !mbps.is_finite()
            || mbps <= 0.0
        {
            return Err(BlockError::TimedOut(block.timeout()));
        }
        Ok(TransferOutcome {
            index,
            requested_bytes: block.bytes,
            bytes,
            elapsed,
            mbps,
            samples,
            end: BlockEnd::TimedOut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::cancel::CancelHandle;
    use crate::speedtest::transport::TransferEvent;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MB: u64 = 1_000_000;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// `chunk` bytes every `every_ms`.
        Rate { chunk: u64, every_ms: u64 },
        Fail,
        Hang,
    }

    struct Scripted {
        blocks: Vec<Behavior>,
        starts: AtomicUsize,
    }

    impl Scripted {
        fn new(blocks: Vec<Behavior>) -> Self {
            Self {
                blocks,
                starts: AtomicUsize::new(0),
            }
        }

        fn constant(chunk: u64, every_ms: u64) -> Self {
            Self::new(vec![Behavior::Rate { chunk, every_ms }])
        }
    }

    impl TransferPrimitive for Scripted {
        async fn start(&self, bytes: u64) -> Result<EventStream> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            let behavior = self.blocks.get(n).or(self.blocks.last()).copied();
            match behavior {
                Some(Behavior::Rate { chunk, every_ms }) => Ok(paced(bytes, chunk, every_ms)),
                Some(Behavior::Hang) => Ok(stream::pending().boxed()),
                Some(Behavior::Fail) | None => anyhow::bail!("connection refused"),
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

    fn direction(blocks: Vec<BlockSpec>) -> DirectionConfig {
        DirectionConfig {
            blocks,
            ..DirectionConfig::download()
        }
    }

    async fn measure(
        config: &DirectionConfig,
        primitive: &Scripted,
        cancel: &CancelToken,
    ) -> (DirectionMeasurement, Vec<SampleTick>) {
        let stabilization = StabilizationConfig::default();
        let sampler = ThroughputSampler::new(
            Direction::Download,
            config,
            &stabilization,
            Duration::from_secs(240),
            cancel,
        );
        let mut ticks = Vec::new();
        let measurement = sampler.measure(primitive, |t| ticks.push(t)).await;
        (measurement, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_rate_block() {
        // 1 MB every 40 ms is 200 Mbps.
        let config = direction(vec![BlockSpec::new(100 * MB, 60_000)]);
        let (m, ticks) = measure(&config, &Scripted::constant(MB, 40), &CancelToken::never()).await;

        assert_eq!(m.blocks.len(), 1);
        let block = &m.blocks[0];
        assert_eq!(block.end, BlockEnd::Completed);
        assert_eq!(block.bytes, 100 * MB);
        assert_eq!(block.elapsed, Duration::from_secs(4));
        assert_eq!(block.mbps, 200.0);

        // Readings start after the 2s warmup, one per second.
        let at: Vec<u64> = block.samples.iter().map(|s| s.elapsed.as_secs()).collect();
        assert_eq!(at, vec![2, 3, 4]);
        assert!(block.samples.iter().all(|s| s.mbps == 200.0));
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[2].schedule_fraction(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plateau_stops_block_early() {
        // 1 MB every 200 ms is 40 Mbps; the 200 MB block would need 40s.
        let config = direction(vec![BlockSpec::new(200 * MB, 120_000)]);
        let (m, _) = measure(&config, &Scripted::constant(MB, 200), &CancelToken::never()).await;

        let block = &m.blocks[0];
        assert_eq!(block.end, BlockEnd::Stabilized);
        assert_eq!(block.elapsed, Duration::from_secs(20));
        assert_eq!(block.bytes, 100 * MB);
        assert_eq!(block.mbps, 40.0);
        assert_eq!(block.samples.len(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistent_blocks_end_schedule() {
        let config = direction(vec![
            BlockSpec::new(100 * MB, 60_000),
            BlockSpec::new(150 * MB, 90_000),
            BlockSpec::new(200 * MB, 120_000),
        ]);
        let primitive = Scripted::constant(MB, 40);
        let (m, _) = measure(&config, &primitive, &CancelToken::never()).await;

        assert_eq!(m.speeds(), vec![200.0, 200.0]);
        assert_eq!(primitive.starts.load(Ordering::SeqCst), 2);
        assert_eq!(m.speed(), Some(200.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistent_blocks_run_full_schedule() {
        let config = direction(vec![
            BlockSpec::new(50 * MB, 60_000),
            BlockSpec::new(50 * MB, 60_000),
            BlockSpec::new(50 * MB, 60_000),
        ]);
        // 200, 100 and 200 Mbps.
        let primitive = Scripted::new(vec![
            Behavior::Rate { chunk: MB, every_ms: 40 },
            Behavior::Rate { chunk: MB, every_ms: 80 },
            Behavior::Rate { chunk: MB, every_ms: 40 },
        ]);
        let (m, _) = measure(&config, &primitive, &CancelToken::never()).await;

        assert_eq!(m.speeds(), vec![200.0, 100.0, 200.0]);
        assert_eq!(m.speed(), Some(200.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_fast_block_is_discarded() {
        let config = direction(vec![
            BlockSpec::new(MB, 10_000),
            BlockSpec::new(100 * MB, 60_000),
        ]);
        let (m, _) = measure(&config, &Scripted::constant(MB, 40), &CancelToken::never()).await;

        assert_eq!(m.blocks.len(), 1);
        assert_eq!(m.blocks[0].index, 1);
        assert_eq!(m.failures.len(), 1);
        assert!(m.failures[0].contains("minimum block duration"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_block_is_salvaged() {
        // 40 Mbps against a 50 MB block needs 10s; the timeout is 5s.
        let config = direction(vec![BlockSpec::new(50 * MB, 5_000)]);
        let (m, _) = measure(&config, &Scripted::constant(MB, 200), &CancelToken::never()).await;

        let block = &m.blocks[0];
        assert_eq!(block.end, BlockEnd::TimedOut);
        assert_eq!(block.elapsed, Duration::from_secs(5));
        assert!((block.mbps - 40.0).abs() < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_first_block_ends_schedule() {
        let config = direction(vec![
            BlockSpec::new(10 * MB, 3_000),
            BlockSpec::new(20 * MB, 6_000),
        ]);
        let primitive = Scripted::new(vec![Behavior::Hang, Behavior::Rate { chunk: MB, every_ms: 40 }]);
        let (m, _) = measure(&config, &primitive, &CancelToken::never()).await;

        assert!(m.blocks.is_empty());
        assert_eq!(primitive.starts.load(Ordering::SeqCst), 1);
        assert!(m.failure_summary().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_move_to_next_block() {
        let config = direction(vec![
            BlockSpec::new(100 * MB, 60_000),
            BlockSpec::new(100 * MB, 60_000),
        ]);
        let primitive = Scripted::new(vec![Behavior::Fail, Behavior::Rate { chunk: MB, every_ms: 40 }]);
        let (m, _) = measure(&config, &primitive, &CancelToken::never()).await;

        assert_eq!(m.speeds(), vec![200.0]);
        assert!(m.failures[0].contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_block_failing() {
        let config = DirectionConfig::download();
        let (m, _) = measure(&config, &Scripted::new(vec![Behavior::Fail]), &CancelToken::never()).await;

        assert!(m.blocks.is_empty());
        assert_eq!(m.failures.len(), 3);
        assert_eq!(m.speed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_block() {
        let config = direction(vec![BlockSpec::new(200 * MB, 120_000)]);
        let handle = CancelHandle::new();
        let token = handle.token();
        let stabilization = StabilizationConfig::default();
        let sampler = ThroughputSampler::new(
            Direction::Download,
            &config,
            &stabilization,
            Duration::from_secs(240),
            &token,
        );

        let primitive = Scripted::constant(MB, 200);
        let m = sampler
            .measure(&primitive, |tick| {
                if tick.sample.elapsed >= Duration::from_secs(3) {
                    handle.cancel();
                }
            })
            .await;

        assert!(m.cancelled);
        assert!(m.blocks.is_empty());
        assert_eq!(m.failure_summary(), "cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_skips_blocks() {
        let mut config = direction(vec![
            BlockSpec::new(100 * MB, 60_000),
            BlockSpec::new(150 * MB, 90_000),
            BlockSpec::new(200 * MB, 120_000),
        ]);
        config.consistency_tolerance_pct = 0.0;
        let stabilization = StabilizationConfig::default();
        let token = CancelToken::never();
        let sampler = ThroughputSampler::new(
            Direction::Download,
            &config,
            &stabilization,
            Duration::from_secs(5),
            &token,
        );

        let m = sampler.measure(&Scripted::constant(MB, 40), |_| {}).await;
        // The second block starts at 4s, inside the budget; the third would not.
        assert_eq!(m.blocks.len(), 2);
    }

    #[test]
    fn test_peak_covers_samples_and_blocks() {
        let sample = |mbps| ThroughputSample {
            direction: Direction::Download,
            elapsed: Duration::from_secs(2),
            mbps,
        };
        let block = |mbps, samples| TransferOutcome {
            index: 0,
            requested_bytes: MB,
            bytes: MB,
            elapsed: Duration::from_secs(3),
            mbps,
            samples,
            end: BlockEnd::Completed,
        };
        let mut m = DirectionMeasurement::new(Direction::Download);
        m.blocks.push(block(90.0, vec![sample(120.0), sample(80.0)]));
        m.blocks.push(block(95.0, vec![]));
        assert_eq!(m.peak(), Some(120.0));
    }
}
