pub mod clock;
pub mod config;
pub mod monitor;
pub mod probe;
pub mod process;
pub mod report;
pub mod shutdown;
pub mod throughput;
pub mod traffic;

#[cfg(test)]
mod monitor_tests;

pub use clock::{Clock, SystemClock};
pub use config::{
    AutostopConfig, ConfigError, ProcessProbeConfig, ThroughputProbeConfig, TrafficProbeConfig,
};
pub use monitor::InactivityMonitor;
pub use probe::{ActivityProbe, ProbeError, ProbeOutcome, ProbeReading, ProbeResult};
pub use process::{ManagementProcessProbe, ProcessEntry, ProcessSource, SysinfoProcessSource};
pub use report::{CycleReport, Decision};
pub use shutdown::{HostShutdown, ShutdownAction, ShutdownError};
pub use throughput::{ByteCounter, DownloadThroughputProbe, SysinfoByteCounter};
pub use traffic::{InterfaceInfo, PacketCapture, PcapCapture, ProtocolTrafficProbe};
