use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// At least one probe saw activity; the idle clock was reset.
    Active,
    /// Nothing seen, but the timeout has not elapsed yet.
    Idle,
    /// Timeout reached in dry-run mode; nothing was executed.
    DryRunShutdown,
    ShutdownDispatched,
    ShutdownFailed { error: String },
    /// A shutdown was already dispatched by an earlier cycle.
    Terminated,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Active => "ACTIVE",
            Decision::Idle => "INACTIVE_PENDING",
            Decision::DryRunShutdown => "DRY_RUN_SHUTDOWN",
            Decision::ShutdownDispatched => "SHUTTING_DOWN",
            Decision::ShutdownFailed { .. } => "SHUTDOWN_FAILED",
            Decision::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub ts: DateTime<Utc>,
    pub cycle: u64,
    pub probes: Vec<ProbeResult>,
    pub any_activity: bool,
    pub last_activity: DateTime<Utc>,
    pub idle_secs: u64,
    pub remaining_secs: u64,
    pub cycle_ms: u128,
    pub decision: Decision,
}

impl CycleReport {
    pub fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|result| result.probe == name)
    }
}
