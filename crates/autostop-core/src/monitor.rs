use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AutostopConfig;
use crate::probe::{ActivityProbe, ProbeError, ProbeResult};
use crate::report::{CycleReport, Decision};
use crate::shutdown::ShutdownAction;

pub struct InactivityMonitor<C: Clock> {
    probes: Vec<Arc<dyn ActivityProbe>>,
    shutdown: Arc<dyn ShutdownAction>,
    clock: C,
    config: AutostopConfig,
    last_activity: DateTime<Utc>,
    cycles: u64,
    shutdown_dispatched: bool,
}

impl<C: Clock> InactivityMonitor<C> {
    pub fn new(
        config: AutostopConfig,
        probes: Vec<Arc<dyn ActivityProbe>>,
        shutdown: Arc<dyn ShutdownAction>,
        clock: C,
    ) -> Self {
        let last_activity = clock.now();
        Self {
            probes,
            shutdown,
            clock,
            config,
            last_activity,
            cycles: 0,
            shutdown_dispatched: false,
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown_dispatched
    }

    pub fn poll_period(&self) -> Duration {
        self.config.poll_period
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|probe| probe.name()).collect()
    }

    /// Polls until a real shutdown has been dispatched. Dry-run never returns.
    pub async fn run<F>(&mut self, mut on_report: F)
    where
        F: FnMut(&CycleReport),
    {
        loop {
            let started = Instant::now();
            let report = self.tick().await;
            on_report(&report);

            if self.shutdown_dispatched {
                break;
            }

            sleep(self.config.poll_period.saturating_sub(started.elapsed())).await;
        }
    }

    pub async fn tick(&mut self) -> CycleReport {
        self.cycles += 1;
        let started = Instant::now();

        if self.shutdown_dispatched {
            let now = self.clock.now();
            return self.report(Vec::new(), false, Decision::Terminated, now, started.elapsed());
        }

        let results = self.run_probes().await;
        for failed in results.iter().filter(|result| result.is_failed()) {
            warn!(probe = %failed.probe, error = %failed.detail(), "probe failed, counting as no activity");
        }
        for result in &results {
            debug!(probe = %result.probe, active = result.is_active(), detail = %result.detail(), "probe result");
        }

        let now = self.clock.now();
        let any_activity = results.iter().any(ProbeResult::is_active);
        if any_activity {
            self.last_activity = self.last_activity.max(now);
        }

        let idle = self.idle_at(now);
        let decision = if any_activity {
            Decision::Active
        } else if idle < self.config.inactivity_timeout {
            Decision::Idle
        } else if self.config.dry_run {
            warn!(
                idle_secs = idle.as_secs(),
                "inactivity timeout reached, would shut down (dry run)"
            );
            Decision::DryRunShutdown
        } else {
            self.dispatch_shutdown(idle).await
        };

        let report = self.report(results, any_activity, decision, now, started.elapsed());
        info!(
            cycle = report.cycle,
            probes = %summarize(&report.probes),
            idle_secs = report.idle_secs,
            remaining_secs = report.remaining_secs,
            state = report.decision.label(),
            "cycle"
        );
        report
    }

    async fn dispatch_shutdown(&mut self, idle: Duration) -> Decision {
        warn!(
            idle_secs = idle.as_secs(),
            timeout_secs = self.config.inactivity_timeout.as_secs(),
            "inactivity timeout reached, shutting down the instance"
        );
        match self.shutdown.shutdown().await {
            Ok(()) => {
                self.shutdown_dispatched = true;
                Decision::ShutdownDispatched
            }
            Err(err) => {
                error!(error = %err, "shutdown dispatch failed, retrying next cycle");
                Decision::ShutdownFailed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn run_probes(&self) -> Vec<ProbeResult> {
        let grace = self.config.probe_grace;

        if self.config.sequential_probes {
            let mut results = Vec::with_capacity(self.probes.len());
            for probe in &self.probes {
                results.push(run_bounded(Arc::clone(probe), grace).await);
            }
            return results;
        }

        let handles = self
            .probes
            .iter()
            .map(|probe| tokio::spawn(run_bounded(Arc::clone(probe), grace)))
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(handles.len());
        for (probe, handle) in self.probes.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => ProbeResult::from_measurement(
                    probe.name(),
                    Err(ProbeError::Join(err.to_string())),
                    Duration::ZERO,
                ),
            };
            results.push(result);
        }
        results
    }

    fn idle_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or(Duration::ZERO)
    }

    fn report(
        &self,
        probes: Vec<ProbeResult>,
        any_activity: bool,
        decision: Decision,
        now: DateTime<Utc>,
        elapsed: Duration,
    ) -> CycleReport {
        let idle = if any_activity {
            Duration::ZERO
        } else {
            self.idle_at(now)
        };

        CycleReport {
            ts: now,
            cycle: self.cycles,
            probes,
            any_activity,
            last_activity: self.last_activity,
            idle_secs: idle.as_secs(),
            remaining_secs: self.config.inactivity_timeout.saturating_sub(idle).as_secs(),
            cycle_ms: elapsed.as_millis(),
            decision,
        }
    }
}

async fn run_bounded(probe: Arc<dyn ActivityProbe>, grace: Duration) -> ProbeResult {
    let budget = probe.max_blocking().saturating_add(grace);
    let started = Instant::now();
    let measured = match timeout(budget, probe.measure()).await {
        Ok(measured) => measured,
        Err(_) => Err(ProbeError::TimedOut(budget)),
    };
    ProbeResult::from_measurement(probe.name(), measured, started.elapsed())
}

fn summarize(results: &[ProbeResult]) -> String {
    results
        .iter()
        .map(|result| {
            let value = if result.is_failed() {
                "error".to_string()
            } else {
                result.is_active().to_string()
            };
            format!("{}={}", result.probe, value)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
