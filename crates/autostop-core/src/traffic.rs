use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pcap::{Active, Capture, Device};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TrafficProbeConfig;
use crate::probe::{ActivityProbe, ProbeError, ProbeReading};

const POLL_STEP: Duration = Duration::from_millis(50);
const SNAPLEN: i32 = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub packets: usize,
    pub interfaces: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: Option<String>,
    pub up: bool,
    pub loopback: bool,
}

/// Blocking packet capture bounded by a timeout and a packet count.
pub trait PacketCapture: Send + Sync {
    fn capture(
        &self,
        port: u16,
        timeout: Duration,
        max_packets: usize,
    ) -> Result<CaptureSummary, ProbeError>;
}

/// libpcap-backed capture over every interface that is up.
///
/// Interfaces are listed again on each call; one that fails to open is
/// skipped and the capture carries on with the rest.
#[derive(Debug, Default)]
pub struct PcapCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    Packet,
    Empty,
}

/// One open, non-blocking capture handle.
pub(crate) trait InterfaceCapture: Send {
    fn name(&self) -> &str;
    fn read(&mut self) -> Result<ReadStatus, String>;
}

struct PcapInterface {
    name: String,
    cap: Capture<Active>,
}

impl PcapInterface {
    fn open(name: &str, filter: &str) -> Result<Self, pcap::Error> {
        let mut cap = Capture::from_device(name)?
            .promisc(false)
            .snaplen(SNAPLEN)
            .timeout(POLL_STEP.as_millis() as i32)
            .immediate_mode(true)
            .open()?
            .setnonblock()?;
        cap.filter(filter, true)?;
        Ok(Self {
            name: name.to_string(),
            cap,
        })
    }
}

impl InterfaceCapture for PcapInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<ReadStatus, String> {
        match self.cap.next_packet() {
            Ok(_) => Ok(ReadStatus::Packet),
            Err(pcap::Error::TimeoutExpired) => Ok(ReadStatus::Empty),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl PcapCapture {
    pub fn new() -> Self {
        Self
    }

    pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, ProbeError> {
        let devices = Device::list().map_err(|err| ProbeError::Capture(err.to_string()))?;
        Ok(devices
            .into_iter()
            .map(|dev| InterfaceInfo {
                up: dev.flags.is_up(),
                loopback: dev.flags.is_loopback(),
                name: dev.name,
                description: dev.desc,
            })
            .collect())
    }

    fn capturable_names() -> Result<Vec<String>, ProbeError> {
        let devices = Device::list().map_err(|err| ProbeError::Capture(err.to_string()))?;
        Ok(devices
            .into_iter()
            // "any" would duplicate every other interface.
            .filter(|dev| dev.name != "any" && dev.flags.is_up())
            .map(|dev| dev.name)
            .collect())
    }
}

impl PacketCapture for PcapCapture {
    fn capture(
        &self,
        port: u16,
        timeout: Duration,
        max_packets: usize,
    ) -> Result<CaptureSummary, ProbeError> {
        let filter = format!("udp port {port}");
        let (opened, skipped) = open_interfaces(Self::capturable_names()?, |name| {
            PcapInterface::open(name, &filter)
                .map(|iface| Box::new(iface) as Box<dyn InterfaceCapture>)
                .map_err(|err| err.to_string())
        });
        collect_packets(opened, skipped, timeout, max_packets)
    }
}

/// Opens every named interface, keeping the names of those that failed.
pub(crate) fn open_interfaces<F>(
    names: Vec<String>,
    mut open: F,
) -> (Vec<Box<dyn InterfaceCapture>>, Vec<String>)
where
    F: FnMut(&str) -> Result<Box<dyn InterfaceCapture>, String>,
{
    let mut opened = Vec::new();
    let mut skipped = Vec::new();
    for name in names {
        match open(&name) {
            Ok(iface) => opened.push(iface),
            Err(err) => {
                warn!(interface = %name, error = %err, "skipping interface");
                skipped.push(name);
            }
        }
    }
    (opened, skipped)
}

/// Drains the open interfaces until `max_packets` have been seen or
/// `timeout` has elapsed, whichever comes first.
pub(crate) fn collect_packets(
    mut opened: Vec<Box<dyn InterfaceCapture>>,
    skipped: Vec<String>,
    timeout: Duration,
    max_packets: usize,
) -> Result<CaptureSummary, ProbeError> {
    if opened.is_empty() {
        return Err(ProbeError::Capture(format!(
            "no interface could be opened for capture (skipped: {})",
            skipped.join(", ")
        )));
    }

    // None means the timeout is too large to represent; only the count bounds it.
    let deadline = Instant::now().checked_add(timeout);
    let expired = || deadline.is_some_and(|at| Instant::now() >= at);
    let mut broken = vec![false; opened.len()];
    let mut packets = 0_usize;

    'poll: loop {
        for (idx, iface) in opened.iter_mut().enumerate() {
            if broken[idx] {
                continue;
            }
            loop {
                if expired() {
                    break 'poll;
                }
                match iface.read() {
                    Ok(ReadStatus::Packet) => {
                        packets += 1;
                        if packets >= max_packets {
                            break 'poll;
                        }
                    }
                    Ok(ReadStatus::Empty) => break,
                    Err(err) => {
                        warn!(interface = %iface.name(), error = %err, "capture failed mid-window");
                        broken[idx] = true;
                        break;
                    }
                }
            }
        }

        if expired() || broken.iter().all(|b| *b) {
            break;
        }
        let pause = match deadline {
            Some(at) => POLL_STEP.min(at.saturating_duration_since(Instant::now())),
            None => POLL_STEP,
        };
        std::thread::sleep(pause);
    }

    let interfaces = opened
        .iter()
        .zip(&broken)
        .filter(|(_, broken)| !**broken)
        .map(|(iface, _)| iface.name().to_string())
        .collect::<Vec<_>>();
    let mut skipped = skipped;
    skipped.extend(
        opened
            .iter()
            .zip(&broken)
            .filter(|(_, broken)| **broken)
            .map(|(iface, _)| iface.name().to_string()),
    );
    debug!(packets, ?interfaces, ?skipped, "capture finished");

    if interfaces.is_empty() && packets == 0 {
        return Err(ProbeError::Capture(format!(
            "every interface failed during capture: {}",
            skipped.join(", ")
        )));
    }

    Ok(CaptureSummary {
        packets,
        interfaces,
        skipped,
    })
}

pub struct ProtocolTrafficProbe<P: PacketCapture + 'static> {
    capture: Arc<P>,
    port: u16,
    timeout: Duration,
    max_packet_count: usize,
}

impl<P: PacketCapture + 'static> ProtocolTrafficProbe<P> {
    pub fn new(capture: P, config: &TrafficProbeConfig) -> Self {
        Self {
            capture: Arc::new(capture),
            port: config.port,
            timeout: config.timeout,
            max_packet_count: config.max_packet_count,
        }
    }
}

#[async_trait]
impl<P: PacketCapture + 'static> ActivityProbe for ProtocolTrafficProbe<P> {
    fn name(&self) -> &'static str {
        "traffic"
    }

    fn max_blocking(&self) -> Duration {
        self.timeout
    }

    async fn measure(&self) -> Result<ProbeReading, ProbeError> {
        let capture = Arc::clone(&self.capture);
        let (port, timeout, max) = (self.port, self.timeout, self.max_packet_count);

        let summary = tokio::task::spawn_blocking(move || capture.capture(port, timeout, max))
            .await
            .map_err(|err| ProbeError::Join(err.to_string()))??;

        let mut detail = format!(
            "{} packet(s) on udp port {} via [{}]",
            summary.packets,
            self.port,
            summary.interfaces.join(", ")
        );
        if !summary.skipped.is_empty() {
            detail.push_str(&format!(" (skipped: {})", summary.skipped.join(", ")));
        }

        Ok(ProbeReading::new(summary.packets > 0, detail))
    }
}
