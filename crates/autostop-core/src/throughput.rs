use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::Networks;
use tokio::time::sleep;
use tracing::debug;

use crate::config::ThroughputProbeConfig;
use crate::probe::{ActivityProbe, ProbeError, ProbeReading};

/// Cumulative count of bytes received by the host since boot.
pub trait ByteCounter: Send + Sync {
    fn bytes_received(&self) -> Result<u64, ProbeError>;
}

/// Sums `total_received` over every interface sysinfo reports.
pub struct SysinfoByteCounter {
    networks: Mutex<Networks>,
}

impl SysinfoByteCounter {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoByteCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCounter for SysinfoByteCounter {
    fn bytes_received(&self) -> Result<u64, ProbeError> {
        let mut networks = self
            .networks
            .lock()
            .map_err(|_| ProbeError::Other("network counter lock poisoned".to_string()))?;
        // Interfaces come and go with container recreation.
        networks.refresh_list();

        Ok(networks
            .iter()
            .map(|(_, data)| data.total_received())
            .sum())
    }
}

pub fn throughput_mbps(bytes_delta: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes_delta as f64 * 8.0) / (secs * 1_000_000.0)
}

pub struct DownloadThroughputProbe<C: ByteCounter> {
    counter: C,
    threshold_mbps: f64,
    sample_window: Duration,
}

impl<C: ByteCounter> DownloadThroughputProbe<C> {
    pub fn new(counter: C, config: &ThroughputProbeConfig) -> Self {
        Self {
            counter,
            threshold_mbps: config.threshold_mbps,
            sample_window: config.sample_window,
        }
    }

    pub fn is_above_threshold(&self, bytes_delta: u64) -> bool {
        throughput_mbps(bytes_delta, self.sample_window) > self.threshold_mbps
    }
}

#[async_trait]
impl<C: ByteCounter> ActivityProbe for DownloadThroughputProbe<C> {
    fn name(&self) -> &'static str {
        "download"
    }

    fn max_blocking(&self) -> Duration {
        self.sample_window
    }

    async fn measure(&self) -> Result<ProbeReading, ProbeError> {
        let initial = self.counter.bytes_received()?;
        sleep(self.sample_window).await;
        let last = self.counter.bytes_received()?;

        // A vanished interface can make the sum go backwards.
        let delta = last.saturating_sub(initial);
        let mbps = throughput_mbps(delta, self.sample_window);
        debug!(delta, mbps, "download sample");

        Ok(ProbeReading::new(
            mbps > self.threshold_mbps,
            format!(
                "{mbps:.2} Mbps over {:.1}s (threshold {} Mbps)",
                self.sample_window.as_secs_f64(),
                self.threshold_mbps
            ),
        ))
    }
}
