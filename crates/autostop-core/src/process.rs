use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::warn;

use crate::config::ProcessProbeConfig;
use crate::probe::{ActivityProbe, ProbeError, ProbeReading};

const SCAN_BUDGET: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
}

pub trait ProcessSource: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessEntry>, ProbeError>;
}

pub struct SysinfoProcessSource {
    system: Mutex<System>,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn processes(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| ProbeError::ProcessTable("process table lock poisoned".to_string()))?;
        system.refresh_processes();

        Ok(system
            .processes()
            .values()
            .map(|proc_| ProcessEntry {
                pid: proc_.pid().as_u32(),
                name: proc_.name().to_string(),
                cmd: proc_.cmd().to_vec(),
            })
            .collect())
    }
}

/// Matches configuration-tool runs: an interpreter process whose arguments
/// carry one of the tool markers.
#[derive(Debug, Clone)]
pub struct ProcessSignature {
    runtime_names: Vec<String>,
    markers: Vec<String>,
}

impl ProcessSignature {
    pub fn new(runtime_names: Vec<String>, markers: Vec<String>) -> Self {
        Self {
            runtime_names,
            markers,
        }
    }

    /// `python3.11` matches the runtime `python3`.
    fn is_runtime(&self, candidate: &str) -> bool {
        self.runtime_names.iter().any(|runtime| {
            candidate
                .strip_prefix(runtime.as_str())
                .map(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
                .unwrap_or(false)
        })
    }

    pub fn matches(&self, entry: &ProcessEntry) -> bool {
        // Scripts launched through a shebang report the script as their
        // name, so the interpreter is read from argv[0] as well.
        let argv0 = entry
            .cmd
            .first()
            .and_then(|arg| Path::new(arg).file_name())
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        if !self.is_runtime(&entry.name) && !self.is_runtime(argv0) {
            return false;
        }

        entry
            .cmd
            .iter()
            .skip(1)
            .any(|arg| self.markers.iter().any(|marker| arg.contains(marker.as_str())))
    }
}

pub struct ManagementProcessProbe<S: ProcessSource + 'static> {
    source: Arc<S>,
    signature: ProcessSignature,
    unreadable_table_is_activity: bool,
}

impl<S: ProcessSource + 'static> ManagementProcessProbe<S> {
    pub fn new(source: S, config: &ProcessProbeConfig) -> Self {
        Self {
            source: Arc::new(source),
            signature: ProcessSignature::new(config.runtime_names.clone(), config.markers.clone()),
            unreadable_table_is_activity: config.unreadable_table_is_activity,
        }
    }

    pub async fn matching_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let entries = self.snapshot().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| self.signature.matches(entry))
            .collect())
    }

    async fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.processes())
            .await
            .map_err(|err| ProbeError::Join(err.to_string()))?
    }

    fn unreadable(&self, reason: String) -> Result<ProbeReading, ProbeError> {
        if self.unreadable_table_is_activity {
            warn!(%reason, "process table unreadable, assuming activity");
            return Ok(ProbeReading::new(
                true,
                format!("process table unreadable ({reason}), assuming activity"),
            ));
        }
        Err(ProbeError::ProcessTable(reason))
    }
}

#[async_trait]
impl<S: ProcessSource + 'static> ActivityProbe for ManagementProcessProbe<S> {
    fn name(&self) -> &'static str {
        "management"
    }

    fn max_blocking(&self) -> Duration {
        SCAN_BUDGET
    }

    async fn measure(&self) -> Result<ProbeReading, ProbeError> {
        let entries = match self.snapshot().await {
            Ok(entries) => entries,
            Err(err) => return self.unreadable(err.to_string()),
        };

        if entries.is_empty() {
            if self.unreadable_table_is_activity {
                return self.unreadable("empty process list".to_string());
            }
            return Ok(ProbeReading::new(false, "empty process list"));
        }

        let matched = entries
            .iter()
            .filter(|entry| self.signature.matches(entry))
            .map(|entry| entry.pid.to_string())
            .collect::<Vec<_>>();

        let detail = if matched.is_empty() {
            format!("no management process among {} processes", entries.len())
        } else {
            format!("management process running (pid {})", matched.join(", "))
        };

        Ok(ProbeReading::new(!matched.is_empty(), detail))
    }
}
