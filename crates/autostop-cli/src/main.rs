use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use autostop_core::{
    ActivityProbe, AutostopConfig, CycleReport, DownloadThroughputProbe, HostShutdown,
    InactivityMonitor, ManagementProcessProbe, PcapCapture, ProcessProbeConfig,
    ProtocolTrafficProbe, SysinfoByteCounter, SysinfoProcessSource, SystemClock,
    ThroughputProbeConfig, TrafficProbeConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod output;

#[derive(Debug, Parser)]
#[command(name = "autostopd")]
#[command(about = "Shuts the instance down once nobody has used it for a while")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Seconds without activity before the host is shut down
    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_TIMEOUT", default_value_t = 900)]
    timeout_secs: u64,

    /// Seconds between two checks
    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_CHECK_PERIOD_SECONDS", default_value_t = 30)]
    check_period_secs: u64,

    /// UDP port of the streaming control channel
    #[arg(
        long,
        env = "CLOUDYPAD_AUTOSTOP_MOONLIGHT_ACTIVITY_PORT",
        default_value_t = 47999,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Log the shutdown instead of executing it
    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_DRY_RUN")]
    dry_run: bool,

    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_DOWNLOAD_THRESHOLD_MBPS", default_value_t = 10.0)]
    download_threshold_mbps: f64,

    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_DOWNLOAD_WINDOW_SECONDS", default_value_t = 5)]
    download_window_secs: u64,

    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_CAPTURE_TIMEOUT_SECONDS", default_value_t = 5)]
    capture_timeout_secs: u64,

    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_CAPTURE_PACKET_COUNT", default_value_t = 1)]
    capture_packet_count: usize,

    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_PROBE_GRACE_SECONDS", default_value_t = 5)]
    probe_grace_secs: u64,

    #[arg(
        long,
        env = "CLOUDYPAD_AUTOSTOP_PROCESS_RUNTIMES",
        value_delimiter = ',',
        default_value = "python,python3"
    )]
    process_runtimes: Vec<String>,

    #[arg(
        long,
        env = "CLOUDYPAD_AUTOSTOP_PROCESS_MARKERS",
        value_delimiter = ',',
        default_value = "ansible"
    )]
    process_markers: Vec<String>,

    /// Count an empty or unreadable process table as activity
    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_UNREADABLE_PROCESS_TABLE_IS_ACTIVITY")]
    unreadable_process_table_is_activity: bool,

    /// Run probes one after another instead of concurrently
    #[arg(long, env = "CLOUDYPAD_AUTOSTOP_SEQUENTIAL_PROBES")]
    sequential_probes: bool,

    #[arg(
        long,
        env = "CLOUDYPAD_AUTOSTOP_SHUTDOWN_COMMAND",
        default_value = "sudo shutdown -h now"
    )]
    shutdown_command: String,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Poll until the inactivity timeout fires (default)
    Run {
        /// Also print every cycle report to stdout
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Run a single cycle without ever shutting down
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// List the interfaces the traffic probe can capture on
    Interfaces,
    /// List processes matching the management signature
    Processes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

impl Cli {
    fn monitor_config(&self) -> AutostopConfig {
        AutostopConfig {
            inactivity_timeout: Duration::from_secs(self.timeout_secs),
            poll_period: Duration::from_secs(self.check_period_secs),
            dry_run: self.dry_run,
            probe_grace: Duration::from_secs(self.probe_grace_secs),
            sequential_probes: self.sequential_probes,
            throughput: ThroughputProbeConfig {
                threshold_mbps: self.download_threshold_mbps,
                sample_window: Duration::from_secs(self.download_window_secs),
            },
            traffic: TrafficProbeConfig {
                port: self.port,
                timeout: Duration::from_secs(self.capture_timeout_secs),
                max_packet_count: self.capture_packet_count,
            },
            process: ProcessProbeConfig {
                runtime_names: trimmed(&self.process_runtimes),
                markers: trimmed(&self.process_markers),
                unreadable_table_is_activity: self.unreadable_process_table_is_activity,
            },
        }
    }

    fn shutdown_action(&self) -> Result<HostShutdown> {
        let mut parts = self.shutdown_command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("shutdown command must not be empty");
        };
        Ok(HostShutdown::new(program, parts.collect()))
    }
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.monitor_config();
    config.validate()?;

    match cli.command.clone().unwrap_or(Command::Run { format: None }) {
        Command::Interfaces => {
            let interfaces = PcapCapture::list_interfaces()?;
            println!("{}", serde_json::to_string_pretty(&interfaces)?);
        }
        Command::Processes => {
            let probe = ManagementProcessProbe::new(SysinfoProcessSource::new(), &config.process);
            let matched = probe.matching_processes().await?;
            println!("{}", serde_json::to_string_pretty(&matched)?);
        }
        Command::Once { format } => {
            let config = AutostopConfig {
                dry_run: true,
                ..config
            };
            let mut monitor = build_monitor(&cli, config)?;
            let report = monitor.tick().await;
            output::print_report(&report, format)?;
        }
        Command::Run { format } => {
            info!(
                timeout_secs = config.inactivity_timeout.as_secs(),
                check_period_secs = config.poll_period.as_secs(),
                port = config.traffic.port,
                dry_run = config.dry_run,
                "starting autostop"
            );
            let mut monitor = build_monitor(&cli, config)?;
            run_loop(&mut monitor, format).await;
        }
    }

    Ok(())
}

fn build_monitor(cli: &Cli, config: AutostopConfig) -> Result<InactivityMonitor<SystemClock>> {
    let probes: Vec<Arc<dyn ActivityProbe>> = vec![
        Arc::new(ProtocolTrafficProbe::new(PcapCapture::new(), &config.traffic)),
        Arc::new(DownloadThroughputProbe::new(
            SysinfoByteCounter::new(),
            &config.throughput,
        )),
        Arc::new(ManagementProcessProbe::new(
            SysinfoProcessSource::new(),
            &config.process,
        )),
    ];
    let shutdown = Arc::new(cli.shutdown_action()?);

    Ok(InactivityMonitor::new(config, probes, shutdown, SystemClock))
}

async fn run_loop(monitor: &mut InactivityMonitor<SystemClock>, format: Option<OutputFormat>) {
    let on_report = |report: &CycleReport| {
        let Some(format) = format else {
            return;
        };
        if let Err(err) = output::print_report(report, format) {
            warn!(error = %err, "failed to print cycle report");
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("received ctrl-c, stopping");
        }
        _ = monitor.run(on_report) => {
            info!("shutdown dispatched, monitor stopped");
        }
    }
}
