//! Adaptive internet speed measurement.
//!
//! The [`speedtest`] module holds the measurement engine: a latency prober,
//! a throughput sampler with stabilization detection, and the aggregator
//! that folds everything into a [`speedtest::SpeedTestResult`]. Network
//! access goes through the traits in [`speedtest::transport`], so the
//! engine runs equally against real HTTP endpoints or test doubles.

pub mod config;
pub mod speedtest;

pub use config::EngineConfig;
pub use speedtest::{SpeedTest, SpeedTestError, SpeedTestResult};
