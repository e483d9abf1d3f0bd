use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("process table unavailable: {0}")]
    ProcessTable(String),
    #[error("probe exceeded its {0:?} budget")]
    TimedOut(Duration),
    #[error("probe task failed: {0}")]
    Join(String),
    #[error("probe error: {0}")]
    Other(String),
}

/// What a probe saw during one sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    pub active: bool,
    pub detail: String,
}

impl ProbeReading {
    pub fn new(active: bool, detail: impl Into<String>) -> Self {
        Self {
            active,
            detail: detail.into(),
        }
    }
}

/// A bounded, blocking measurement of one kind of user activity.
///
/// Implementations may block for up to [`ActivityProbe::max_blocking`];
/// callers must not expect a near-instant return.
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn max_blocking(&self) -> Duration;
    async fn measure(&self) -> Result<ProbeReading, ProbeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Detected { active: bool, detail: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe: String,
    pub outcome: ProbeOutcome,
    pub elapsed_ms: u128,
}

impl ProbeResult {
    pub fn from_measurement(
        probe: &str,
        measured: Result<ProbeReading, ProbeError>,
        elapsed: Duration,
    ) -> Self {
        let outcome = match measured {
            Ok(reading) => ProbeOutcome::Detected {
                active: reading.active,
                detail: reading.detail,
            },
            Err(err) => ProbeOutcome::Failed {
                error: err.to_string(),
            },
        };
        Self {
            probe: probe.to_string(),
            outcome,
            elapsed_ms: elapsed.as_millis(),
        }
    }

    /// Failed probes count as no activity for the cycle.
    pub fn is_active(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Detected { active: true, .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Failed { .. })
    }

    pub fn detail(&self) -> &str {
        match &self.outcome {
            ProbeOutcome::Detected { detail, .. } => detail,
            ProbeOutcome::Failed { error } => error,
        }
    }
}
