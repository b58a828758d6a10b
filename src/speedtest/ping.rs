use super::cancel::CancelToken;
use super::stats;
use super::transport::{HttpTransport, LatencyTransport};
use crate::config::LatencyConfig;
use anyhow::Result;
use futures::{stream, StreamExt};
use reqwest::header::CACHE_CONTROL;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyResult {
    /// Median of the samples within the tolerance band of the fastest one.
    pub estimate_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Median of successive differences between raw samples.
    pub jitter_ms: f64,
    pub raw_samples: Vec<f64>,
    pub attempted: usize,
    /// Set when too few probes succeeded and the configured fallback was used.
    pub fallback: bool,
}

impl LatencyResult {
    pub fn fallback(config: &LatencyConfig, raw_samples: Vec<f64>, attempted: usize) -> Self {
        Self {
            estimate_ms: config.fallback_ms,
            min_ms: config.fallback_ms,
            max_ms: config.fallback_ms,
            jitter_ms: 0.0,
            raw_samples,
            attempted,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTick {
    pub index: usize,
    pub total: usize,
    pub latency_ms: Option<f64>,
}

/// Runs warmup probes, then `probe_count` counted probes, and summarizes
/// them. Never fails: with too few valid probes the fallback is returned.
pub async fn probe_latency<T: LatencyTransport>(
    transport: &T,
    config: &LatencyConfig,
    cancel: &CancelToken,
    mut on_probe: impl FnMut(ProbeTick) + Send,
) -> LatencyResult {
    if config.endpoints.is_empty() {
        warn!(fallback_ms = config.fallback_ms, "no latency endpoints, using fallback latency");
        return LatencyResult::fallback(config, Vec::new(), 0);
    }

    let timeout = config.probe_timeout();
    let endpoint = |i: usize| config.endpoints[i % config.endpoints.len()].as_str();

    for i in 0..config.warmup_probes {
        let _ = probe_once(transport, endpoint(i), timeout, config.max_plausible_ms).await;
    }

    let total = config.probe_count;
    let mut probes = stream::iter(0..total)
        .map(|i| probe_once(transport, endpoint(config.warmup_probes + i), timeout, config.max_plausible_ms))
        .buffered(config.concurrency.max(1));

    let mut samples = Vec::with_capacity(total);
    let mut index = 0;
    while let Some(latency) = probes.next().await {
        match latency {
            Some(ms) => {
                debug!(probe = index, latency_ms = ms, "probe");
                samples.push(ms);
            }
            None => debug!(probe = index, "probe discarded"),
        }
        on_probe(ProbeTick {
            index,
            total,
            latency_ms: latency,
        });
        index += 1;
        if cancel.is_cancelled() {
            break;
        }
    }

    let result = summarize(samples, index, config);
    if result.fallback {
        warn!(
            valid = result.raw_samples.len(),
            attempted = result.attempted,
            fallback_ms = config.fallback_ms,
            "too few valid probes, using fallback latency"
        );
    } else {
        info!(
            ping_ms = result.estimate_ms,
            min_ms = result.min_ms,
            max_ms = result.max_ms,
            jitter_ms = result.jitter_ms,
            "latency measured"
        );
    }
    result
}

async fn probe_once<T: LatencyTransport>(
    transport: &T,
    endpoint: &str,
    timeout: Duration,
    max_plausible_ms: f64,
) -> Option<f64> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, transport.probe(endpoint)).await {
        Ok(Ok(())) => {
            let ms = start.elapsed().as_secs_f64() * 1000.0;
            (ms > 0.0 && ms <= max_plausible_ms).then_some(ms)
        }
        Ok(Err(e)) => {
            debug!(endpoint, error = %e, "probe failed");
            None
        }
        Err(_) => {
            debug!(endpoint, ?timeout, "probe timed out");
            None
        }
    }
}

/// Reduces valid samples, in probe order, to a robust estimate.
pub fn summarize(samples: Vec<f64>, attempted: usize, config: &LatencyConfig) -> LatencyResult {
    if samples.is_empty() || samples.len() < config.min_valid_probes {
        return LatencyResult::fallback(config, samples, attempted);
    }

    let sorted = stats::sorted(&samples);
    let fastest = sorted[0];
    let ceiling = fastest * config.tolerance_ratio;
    let retained: Vec<f64> = sorted.iter().copied().take_while(|&ms| ms <= ceiling).collect();

    let estimate_ms = stats::median(&retained).unwrap_or(fastest);
    let min_ms = retained.first().copied().unwrap_or(fastest);
    let max_ms = retained.last().copied().unwrap_or(fastest);
    let jitter_ms = stats::median(&stats::successive_differences(&samples)).unwrap_or(0.0);

    LatencyResult {
        estimate_ms,
        min_ms,
        max_ms,
        jitter_ms,
        raw_samples: samples,
        attempted,
        fallback: false,
    }
}

impl LatencyTransport for HttpTransport {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        let response = self
            .client
            .get(endpoint)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?
            .error_for_status()?;
        // Drain the body so every endpoint is timed to its last byte.
        response.bytes().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn config() -> LatencyConfig {
        LatencyConfig {
            endpoints: vec!["a".to_string(), "b".to_string()],
            ..LatencyConfig::default()
        }
    }

    struct Scripted {
        delays_ms: Vec<Option<u64>>,
        calls: AtomicUsize,
        endpoints: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(delays_ms: Vec<Option<u64>>) -> Self {
            Self {
                delays_ms,
                calls: AtomicUsize::new(0),
                endpoints: Mutex::new(Vec::new()),
            }
        }
    }

    impl LatencyTransport for Scripted {
        async fn probe(&self, endpoint: &str) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.endpoints.lock().unwrap().push(endpoint.to_string());
            match self.delays_ms.get(call).copied().flatten() {
                Some(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(())
                }
                None => anyhow::bail!("connection reset"),
            }
        }
    }

    #[test]
    fn test_outliers_do_not_move_estimate() {
        let mut samples = vec![
            20.0, 21.0, 20.5, 22.0, 21.5, 20.0, 23.0, 21.0, 22.5, 20.5, 21.0, 22.0, 20.0, 21.5,
            22.0, 21.0, 20.5,
        ];
        samples.insert(3, 210.0);
        samples.insert(9, 205.0);
        samples.insert(15, 220.0);
        assert_eq!(samples.len(), 20);

        let result = summarize(samples, 20, &config());
        assert!(!result.fallback);
        assert_eq!(result.estimate_ms, 21.0);
        assert_eq!(result.min_ms, 20.0);
        assert_eq!(result.max_ms, 23.0);
        assert!(result.estimate_ms <= 20.0 * 1.3);
    }

    #[test]
    fn test_jitter_uses_raw_probe_order() {
        let result = summarize(vec![10.0, 14.0, 10.0, 14.0, 10.0], 5, &config());
        assert_eq!(result.jitter_ms, 4.0);
        // 14ms sits outside the 130% band, so only the 10ms cluster is kept.
        assert_eq!(result.estimate_ms, 10.0);
        assert_eq!(result.max_ms, 10.0);
    }

    #[test]
    fn test_too_few_samples_fall_back() {
        let result = summarize(vec![12.0, 13.0], 20, &config());
        assert!(result.fallback);
        assert_eq!(result.estimate_ms, 20.0);
        assert_eq!(result.min_ms, 20.0);
        assert_eq!(result.max_ms, 20.0);
        assert_eq!(result.jitter_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probes_fall_back() {
        let transport = Scripted::new(vec![None; 25]);
        let result = probe_latency(&transport, &config(), &CancelToken::never(), |_| {}).await;
        assert!(result.fallback);
        assert_eq!(result.estimate_ms, config().fallback_ms);
        assert!(result.raw_samples.is_empty());
        assert_eq!(result.attempted, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_endpoints_falls_back_without_probing() {
        let config = LatencyConfig {
            endpoints: Vec::new(),
            ..config()
        };
        let transport = Scripted::new(vec![Some(10); 25]);
        let result = probe_latency(&transport, &config, &CancelToken::never(), |_| {}).await;

        assert_eq!(result, LatencyResult::fallback(&config, Vec::new(), 0));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_probe_count_falls_back() {
        let config = LatencyConfig {
            warmup_probes: 0,
            probe_count: 0,
            ..config()
        };
        let transport = Scripted::new(Vec::new());
        let result = probe_latency(&transport, &config, &CancelToken::never(), |_| {}).await;

        assert!(result.fallback);
        assert_eq!(result.attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_and_implausible_probes_are_dropped() {
        let config = LatencyConfig {
            warmup_probes: 0,
            probe_count: 5,
            probe_timeout_ms: 1_000,
            max_plausible_ms: 500.0,
            ..config()
        };
        let transport = Scripted::new(vec![Some(10), Some(5_000), Some(12), None, Some(11)]);
        let mut ticks = Vec::new();
        let result = probe_latency(&transport, &config, &CancelToken::never(), |t| ticks.push(t)).await;

        assert_eq!(result.raw_samples, vec![10.0, 12.0, 11.0]);
        assert_eq!(result.estimate_ms, 11.0);
        assert_eq!(ticks.len(), 5);
        assert_eq!(ticks[1].latency_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_and_endpoint_rotation() {
        let config = LatencyConfig {
            warmup_probes: 1,
            probe_count: 3,
            ..config()
        };
        let transport = Scripted::new(vec![Some(50), Some(10), Some(10), Some(10)]);
        let result = probe_latency(&transport, &config, &CancelToken::never(), |_| {}).await;

        // The slow warmup probe is not counted.
        assert_eq!(result.raw_samples, vec![10.0, 10.0, 10.0]);
        assert_eq!(
            *transport.endpoints.lock().unwrap(),
            vec!["a", "b", "a", "b"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_probes_keep_dispatch_order() {
        let config = LatencyConfig {
            warmup_probes: 0,
            probe_count: 4,
            concurrency: 4,
            ..config()
        };
        let transport = Scripted::new(vec![Some(30), Some(10), Some(20), Some(10)]);
        let start = Instant::now();
        let result = probe_latency(&transport, &config, &CancelToken::never(), |_| {}).await;

        assert_eq!(result.raw_samples, vec![30.0, 10.0, 20.0, 10.0]);
        assert!(start.elapsed() < Duration::from_millis(60));
    }
}
