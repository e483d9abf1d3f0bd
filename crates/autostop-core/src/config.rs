use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("protocol port must be between 1 and 65535")]
    InvalidPort,
    #[error("poll period must be greater than zero")]
    ZeroPollPeriod,
    #[error("inactivity timeout must be greater than zero")]
    ZeroInactivityTimeout,
    #[error("download sampling window must be greater than zero")]
    ZeroSampleWindow,
    #[error("download threshold must be a positive number of Mbps, got {0}")]
    InvalidThreshold(f64),
    #[error("capture packet count must be at least 1")]
    ZeroPacketCount,
    #[error("capture timeout ({capture:?}) must not exceed poll period ({poll:?})")]
    CaptureExceedsPollPeriod { capture: Duration, poll: Duration },
    #[error("process probe needs at least one runtime name and one marker")]
    EmptyProcessSignature,
}

#[derive(Debug, Clone)]
pub struct AutostopConfig {
    pub inactivity_timeout: Duration,
    pub poll_period: Duration,
    pub dry_run: bool,
    /// Extra time allowed past a probe's declared maximum blocking duration
    /// before the monitor abandons it for the cycle.
    pub probe_grace: Duration,
    pub sequential_probes: bool,
    pub throughput: ThroughputProbeConfig,
    pub traffic: TrafficProbeConfig,
    pub process: ProcessProbeConfig,
}

#[derive(Debug, Clone)]
pub struct ThroughputProbeConfig {
    pub threshold_mbps: f64,
    pub sample_window: Duration,
}

#[derive(Debug, Clone)]
pub struct TrafficProbeConfig {
    pub port: u16,
    pub timeout: Duration,
    pub max_packet_count: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessProbeConfig {
    pub runtime_names: Vec<String>,
    pub markers: Vec<String>,
    pub unreadable_table_is_activity: bool,
}

impl Default for AutostopConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(15 * 60),
            poll_period: Duration::from_secs(30),
            dry_run: false,
            probe_grace: Duration::from_secs(5),
            sequential_probes: false,
            throughput: ThroughputProbeConfig::default(),
            traffic: TrafficProbeConfig::default(),
            process: ProcessProbeConfig::default(),
        }
    }
}

impl Default for ThroughputProbeConfig {
    fn default() -> Self {
        Self {
            threshold_mbps: 10.0,
            sample_window: Duration::from_secs(5),
        }
    }
}

impl Default for TrafficProbeConfig {
    fn default() -> Self {
        Self {
            port: 47999,
            timeout: Duration::from_secs(5),
            max_packet_count: 1,
        }
    }
}

impl Default for ProcessProbeConfig {
    fn default() -> Self {
        Self {
            runtime_names: vec!["python".to_string(), "python3".to_string()],
            markers: vec!["ansible".to_string()],
            unreadable_table_is_activity: false,
        }
    }
}

impl AutostopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.traffic.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.poll_period.is_zero() {
            return Err(ConfigError::ZeroPollPeriod);
        }
        if self.inactivity_timeout.is_zero() {
            return Err(ConfigError::ZeroInactivityTimeout);
        }
        if self.throughput.sample_window.is_zero() {
            return Err(ConfigError::ZeroSampleWindow);
        }
        let threshold = self.throughput.threshold_mbps;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        if self.traffic.max_packet_count == 0 {
            return Err(ConfigError::ZeroPacketCount);
        }
        if self.traffic.timeout > self.poll_period {
            return Err(ConfigError::CaptureExceedsPollPeriod {
                capture: self.traffic.timeout,
                poll: self.poll_period,
            });
        }
        if self.process.runtime_names.is_empty() || self.process.markers.is_empty() {
            return Err(ConfigError::EmptyProcessSignature);
        }
        Ok(())
    }
}
