use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::AutostopConfig;
use crate::monitor::InactivityMonitor;
use crate::probe::{ActivityProbe, ProbeError, ProbeOutcome, ProbeReading};
use crate::report::Decision;
use crate::shutdown::{ShutdownAction, ShutdownError};

#[derive(Clone)]
struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2026, 2, 15, 12, 0, 0)
            .single()
            .expect("valid date");
        Self(Arc::new(Mutex::new(start)))
    }

    fn advance(&self, secs: i64) {
        let mut now = self.0.lock().expect("clock lock");
        *now += chrono::Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock lock")
    }
}

/// Replays a script of readings, then reports idle forever.
struct ScriptedProbe {
    name: &'static str,
    script: Mutex<VecDeque<Result<bool, String>>>,
    delay: Duration,
}

impl ScriptedProbe {
    fn new(name: &'static str, script: Vec<Result<bool, String>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
        })
    }

    fn idle(name: &'static str) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    fn stuck(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(VecDeque::new()),
            delay,
        })
    }
}

#[async_trait]
impl ActivityProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn max_blocking(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn measure(&self) -> Result<ProbeReading, ProbeError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(false));
        next.map(|active| ProbeReading::new(active, "scripted"))
            .map_err(ProbeError::Other)
    }
}

#[derive(Default)]
struct RecordingShutdown {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl RecordingShutdown {
    fn failing(times: usize) -> Arc<Self> {
        let action = Self::default();
        action.failures_left.store(times, Ordering::SeqCst);
        Arc::new(action)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShutdownAction for RecordingShutdown {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ShutdownError::Failed {
                command: "shutdown".to_string(),
                status: "exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

fn config(dry_run: bool) -> AutostopConfig {
    AutostopConfig {
        inactivity_timeout: Duration::from_secs(900),
        poll_period: Duration::from_secs(30),
        dry_run,
        probe_grace: Duration::from_secs(1),
        ..AutostopConfig::default()
    }
}

fn monitor_with(
    config: AutostopConfig,
    probes: Vec<Arc<dyn ActivityProbe>>,
    shutdown: Arc<RecordingShutdown>,
) -> (InactivityMonitor<ManualClock>, ManualClock) {
    let clock = ManualClock::new();
    let monitor = InactivityMonitor::new(config, probes, shutdown, clock.clone());
    (monitor, clock)
}

fn idle_probes() -> Vec<Arc<dyn ActivityProbe>> {
    vec![
        ScriptedProbe::idle("download"),
        ScriptedProbe::idle("traffic"),
        ScriptedProbe::idle("management"),
    ]
}

#[tokio::test]
async fn idle_host_is_shut_down_once_on_thirtieth_cycle() {
    // Arrange
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), idle_probes(), Arc::clone(&shutdown));

    // Act
    let mut decisions = Vec::new();
    for _ in 0..30 {
        clock.advance(30);
        decisions.push(monitor.tick().await.decision);
    }

    // Assert
    assert!(decisions[..29].iter().all(|d| *d == Decision::Idle));
    assert_eq!(decisions[29], Decision::ShutdownDispatched);
    assert_eq!(shutdown.calls(), 1);
    assert!(monitor.is_terminated());
}

#[tokio::test]
async fn shutdown_is_never_dispatched_twice() {
    // Arrange
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), idle_probes(), Arc::clone(&shutdown));
    clock.advance(900);
    let first = monitor.tick().await;

    // Act
    clock.advance(30);
    let second = monitor.tick().await;

    // Assert
    assert_eq!(first.decision, Decision::ShutdownDispatched);
    assert_eq!(second.decision, Decision::Terminated);
    assert_eq!(shutdown.calls(), 1);
}

#[tokio::test]
async fn idle_counter_reports_remaining_time() {
    // Arrange
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), idle_probes(), shutdown);

    // Act
    clock.advance(300);
    let report = monitor.tick().await;

    // Assert
    assert_eq!(report.idle_secs, 300);
    assert_eq!(report.remaining_secs, 600);
    assert_eq!(report.probes.len(), 3);
    assert!(!report.any_activity);
}

#[tokio::test]
async fn activity_resets_idle_clock() {
    // Arrange
    let mut script = vec![Ok(false); 20];
    script.push(Ok(true));
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        ScriptedProbe::new("traffic", script),
        ScriptedProbe::idle("download"),
    ];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), probes, Arc::clone(&shutdown));

    // Act
    for _ in 0..20 {
        clock.advance(30);
        monitor.tick().await;
    }
    clock.advance(30);
    let active = monitor.tick().await;
    clock.advance(30);
    let after = monitor.tick().await;

    // Assert
    assert_eq!(active.decision, Decision::Active);
    assert_eq!(active.idle_secs, 0);
    assert_eq!(active.last_activity, active.ts);
    assert_eq!(after.idle_secs, 30);
    assert_eq!(shutdown.calls(), 0);
}

#[tokio::test]
async fn alternating_activity_never_reaches_timeout() {
    // Arrange
    let script = (0..200).map(|i| Ok(i % 2 == 0)).collect::<Vec<_>>();
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        ScriptedProbe::new("download", script),
        ScriptedProbe::idle("traffic"),
        ScriptedProbe::idle("management"),
    ];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), probes, Arc::clone(&shutdown));

    // Act
    let mut max_idle = 0;
    for _ in 0..200 {
        clock.advance(30);
        max_idle = max_idle.max(monitor.tick().await.idle_secs);
    }

    // Assert
    assert_eq!(max_idle, 30);
    assert_eq!(shutdown.calls(), 0);
    assert!(!monitor.is_terminated());
}

#[tokio::test]
async fn dry_run_logs_intent_and_keeps_polling() {
    // Arrange
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(true), idle_probes(), Arc::clone(&shutdown));

    // Act
    let mut decisions = Vec::new();
    for _ in 0..100 {
        clock.advance(30);
        decisions.push(monitor.tick().await.decision);
    }

    // Assert
    let first_intent = decisions
        .iter()
        .position(|d| *d == Decision::DryRunShutdown)
        .expect("dry-run intent");
    assert_eq!(first_intent, 29);
    assert!(decisions[29..].iter().all(|d| *d == Decision::DryRunShutdown));
    assert_eq!(shutdown.calls(), 0);
    assert!(!monitor.is_terminated());
}

#[tokio::test]
async fn management_process_alone_counts_as_activity() {
    // Arrange
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        ScriptedProbe::idle("download"),
        ScriptedProbe::idle("traffic"),
        ScriptedProbe::new("management", vec![Ok(true)]),
    ];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), probes, shutdown);

    // Act
    clock.advance(1_000);
    let report = monitor.tick().await;

    // Assert
    assert_eq!(report.decision, Decision::Active);
    assert!(report.probe("management").expect("management result").is_active());
    assert!(!report.probe("download").expect("download result").is_active());
}

#[tokio::test]
async fn probe_error_counts_as_no_activity() {
    // Arrange
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        ScriptedProbe::new("download", vec![Err("counter unreadable".to_string())]),
        ScriptedProbe::idle("traffic"),
    ];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(config(false), probes, shutdown);

    // Act
    clock.advance(30);
    let report = monitor.tick().await;

    // Assert
    assert_eq!(report.decision, Decision::Idle);
    let download = report.probe("download").expect("download result");
    assert!(download.is_failed());
    assert!(download.detail().contains("counter unreadable"));
}

#[tokio::test]
async fn probe_exceeding_its_budget_is_abandoned() {
    // Arrange
    let mut cfg = config(false);
    cfg.probe_grace = Duration::from_millis(20);
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        ScriptedProbe::stuck("traffic", Duration::from_secs(30)),
        ScriptedProbe::new("download", vec![Ok(true)]),
    ];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, _clock) = monitor_with(cfg, probes, shutdown);

    // Act
    let report = tokio::time::timeout(Duration::from_secs(5), monitor.tick())
        .await
        .expect("cycle must finish despite a stuck probe");

    // Assert
    let traffic = report.probe("traffic").expect("traffic result");
    assert!(matches!(traffic.outcome, ProbeOutcome::Failed { .. }));
    assert!(traffic.detail().contains("budget"));
    assert_eq!(report.decision, Decision::Active);
}

#[tokio::test]
async fn failed_dispatch_is_retried_next_cycle() {
    // Arrange
    let shutdown = RecordingShutdown::failing(1);
    let (mut monitor, clock) = monitor_with(config(false), idle_probes(), Arc::clone(&shutdown));

    // Act
    clock.advance(900);
    let failed = monitor.tick().await;
    clock.advance(30);
    let retried = monitor.tick().await;

    // Assert
    assert!(matches!(failed.decision, Decision::ShutdownFailed { .. }));
    assert_eq!(retried.decision, Decision::ShutdownDispatched);
    assert_eq!(shutdown.calls(), 2);
}

#[tokio::test]
async fn sequential_mode_keeps_registration_order() {
    // Arrange
    let mut cfg = config(false);
    cfg.sequential_probes = true;
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(cfg, idle_probes(), shutdown);

    // Act
    clock.advance(30);
    let report = monitor.tick().await;

    // Assert
    let names = report.probes.iter().map(|p| p.probe.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["download", "traffic", "management"]);
    assert_eq!(monitor.probe_names(), names);
}

#[tokio::test]
async fn run_returns_after_real_shutdown() {
    // Arrange
    let cfg = AutostopConfig {
        inactivity_timeout: Duration::from_millis(40),
        poll_period: Duration::from_millis(10),
        probe_grace: Duration::from_millis(100),
        ..AutostopConfig::default()
    };
    let shutdown = Arc::new(RecordingShutdown::default());
    let mut monitor = InactivityMonitor::new(
        cfg,
        idle_probes(),
        Arc::clone(&shutdown) as Arc<dyn ShutdownAction>,
        SystemClock,
    );

    // Act
    let mut cycles = 0;
    tokio::time::timeout(Duration::from_secs(5), monitor.run(|_| cycles += 1))
        .await
        .expect("run loop should stop after shutdown");

    // Assert
    assert!(cycles >= 2);
    assert_eq!(shutdown.calls(), 1);
    assert!(monitor.is_terminated());
}

#[tokio::test]
async fn huge_grace_does_not_overflow_the_timeout_budget() {
    // Arrange
    let mut cfg = config(false);
    cfg.probe_grace = Duration::MAX;
    cfg.sequential_probes = true;
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![ScriptedProbe::new("traffic", vec![Ok(true)])];
    let shutdown = Arc::new(RecordingShutdown::default());
    let (mut monitor, clock) = monitor_with(cfg, probes, shutdown);

    // Act
    clock.advance(30);
    let report = monitor.tick().await;

    // Assert
    assert_eq!(report.decision, Decision::Active);
    assert!(!report.probe("traffic").expect("traffic result").is_failed());
}
