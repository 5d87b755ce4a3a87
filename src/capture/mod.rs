//! Packet capture adapter.
//!
//! A [`PacketSource`] (live raw socket or pcap replay) is read on a dedicated
//! `capture-reader` thread. Each frame is decoded, filtered, classified and
//! turned into a [`TrafficEvent`], which crosses a bounded channel to the
//! `capture-ingest` thread that feeds the [`Aggregator`]. Neither thread ever
//! touches the tokio runtime, so a slow or blocked capture cannot delay a tick.

pub mod filter;
pub mod packet;
pub mod pcap_file;

#[cfg(target_os = "linux")]
pub mod raw_socket;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::capture::filter::{CaptureFilter, FilterError};
use crate::capture::packet::{PacketHeaders, RawPacket};
use crate::config::{CAPTURE_JOIN_TIMEOUT_MS, CAPTURE_QUEUE_CAPACITY};
use crate::core::{classify, Aggregator, Direction};
use crate::error::AppError;

/// Failures of the capture primitive. None of them is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("live capture is not supported on this platform")]
    Unavailable,

    #[error("insufficient privileges: {0} (needs root or CAP_NET_RAW)")]
    Permission(String),

    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),

    #[error("invalid capture filter {expr:?}: {reason}")]
    Filter { expr: String, reason: FilterError },

    #[error("cannot replay {}: {reason}", path.display())]
    Replay { path: PathBuf, reason: String },

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        AppError::Capture(err.to_string())
    }
}

/// Outcome of one read from a [`PacketSource`].
#[derive(Debug)]
pub enum Poll {
    Packet(RawPacket),
    /// Nothing arrived within the poll timeout.
    Idle,
    /// The source has no more packets (end of a replay file).
    Exhausted,
}

/// A blocking packet producer. `poll_packet` must return within a bounded time.
pub trait PacketSource: Send {
    fn describe(&self) -> String;
    fn poll_packet(&mut self) -> Result<Poll, CaptureError>;
}

/// Where and what to capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    pub server_ip: Option<IpAddr>,
    pub iface: Option<String>,
    pub filter: Option<String>,
    pub pcap: Option<PathBuf>,
}

impl CaptureConfig {
    /// The explicit filter if given, else `host <server_ip>` when known.
    pub fn resolve_filter(&self) -> Result<Option<CaptureFilter>, CaptureError> {
        match self.filter.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => CaptureFilter::parse(expr)
                .map(Some)
                .map_err(|reason| CaptureError::Filter {
                    expr: expr.to_string(),
                    reason,
                }),
            _ => Ok(self.server_ip.map(CaptureFilter::host)),
        }
    }

    fn open_source(&self) -> Result<Box<dyn PacketSource>, CaptureError> {
        if let Some(path) = &self.pcap {
            return Ok(Box::new(pcap_file::PcapReplay::open(path)?));
        }
        open_live(self.iface.as_deref())
    }
}

#[cfg(target_os = "linux")]
fn open_live(iface: Option<&str>) -> Result<Box<dyn PacketSource>, CaptureError> {
    Ok(Box::new(raw_socket::RawSocketSource::open(iface)?))
}

#[cfg(not(target_os = "linux"))]
fn open_live(_iface: Option<&str>) -> Result<Box<dyn PacketSource>, CaptureError> {
    Err(CaptureError::Unavailable)
}

/// One classified packet, ready for [`Aggregator::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficEvent {
    pub timestamp: f64,
    pub client: String,
    pub direction: Direction,
    pub bytes: u64,
    pub protocol: String,
}

/// Decide direction relative to the monitored host and pick the client address.
///
/// With a known server: packets from it are `Out` to the destination, packets
/// to it are `In` from the source, anything else is discarded. Without one,
/// every packet counts as `Out` to its destination.
pub fn resolve_direction(
    headers: &PacketHeaders,
    server_ip: Option<IpAddr>,
) -> Option<(Direction, IpAddr)> {
    match server_ip {
        Some(server) if headers.src == server => Some((Direction::Out, headers.dst)),
        Some(server) if headers.dst == server => Some((Direction::In, headers.src)),
        Some(_) => None,
        None => Some((Direction::Out, headers.dst)),
    }
}

/// Turn a raw frame into an event. `Ok(None)` means the packet was filtered out.
pub fn to_event(
    packet: &RawPacket,
    filter: Option<&CaptureFilter>,
    server_ip: Option<IpAddr>,
) -> Result<Option<TrafficEvent>, packet::PacketError> {
    let headers = packet::decode(packet.link, &packet.data)?;
    if filter.is_some_and(|f| !f.matches(&headers)) {
        return Ok(None);
    }
    let Some((direction, client)) = resolve_direction(&headers, server_ip) else {
        return Ok(None);
    };
    Ok(Some(TrafficEvent {
        timestamp: packet.timestamp,
        client: client.to_string(),
        direction,
        bytes: u64::from(packet.wire_len),
        protocol: classify(headers.layer, headers.src_port, headers.dst_port),
    }))
}

/// Packet counters shared with the capture threads.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub seen: AtomicU64,
    pub recorded: AtomicU64,
    pub dropped: AtomicU64,
}

/// Sends the thread name on the exit channel when the thread ends, including by panic.
struct ExitSignal {
    name: &'static str,
    tx: mpsc::Sender<&'static str>,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

/// Manages the background capture threads.
/// Dropping the engine requests shutdown without waiting.
pub struct CaptureEngine {
    shutdown: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    description: String,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    exited: mpsc::Receiver<&'static str>,
}

impl CaptureEngine {
    /// Open the configured source and start the reader and ingest threads.
    ///
    /// Any error means capture is unavailable; the caller logs it and carries
    /// on without captured traffic.
    pub fn start(config: CaptureConfig, aggregator: Arc<Aggregator>) -> anyhow::Result<Self> {
        let filter = config.resolve_filter()?;
        let source = config
            .open_source()
            .context("failed to open packet source")?;
        Self::spawn(source, filter, config.server_ip, aggregator)
    }

    fn spawn(
        mut source: Box<dyn PacketSource>,
        filter: Option<CaptureFilter>,
        server_ip: Option<IpAddr>,
        aggregator: Arc<Aggregator>,
    ) -> anyhow::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CaptureStats::default());
        let description = source.describe();
        let (event_tx, event_rx) = mpsc::sync_channel::<TrafficEvent>(CAPTURE_QUEUE_CAPACITY);
        let (exit_tx, exited) = mpsc::channel();

        let reader = {
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let signal = ExitSignal {
                name: "capture-reader",
                tx: exit_tx.clone(),
            };
            std::thread::Builder::new()
                .name(signal.name.into())
                .spawn(move || {
                    let _signal = signal;
                    run_reader(
                        source.as_mut(),
                        filter.as_ref(),
                        server_ip,
                        &event_tx,
                        &shutdown,
                        &stats,
                    );
                })
                .context("failed to spawn capture reader thread")?
        };

        let ingest = {
            let worker_shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let signal = ExitSignal {
                name: "capture-ingest",
                tx: exit_tx,
            };
            let spawned = std::thread::Builder::new()
                .name(signal.name.into())
                .spawn(move || {
                    let _signal = signal;
                    run_ingest(&event_rx, &aggregator, &worker_shutdown, &stats);
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    // The reader exits once its channel send fails.
                    shutdown.store(true, Ordering::Relaxed);
                    return Err(e).context("failed to spawn capture ingest thread");
                }
            }
        };

        tracing::info!(
            "CaptureEngine started: {description}{}",
            direction_mode(server_ip)
        );
        Ok(Self {
            shutdown,
            stats,
            description,
            threads: vec![("capture-reader", reader), ("capture-ingest", ingest)],
            exited,
        })
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Request shutdown and wait up to [`CAPTURE_JOIN_TIMEOUT_MS`] for the
    /// threads to exit. Threads still running after that are detached.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(CAPTURE_JOIN_TIMEOUT_MS);

        while !self.threads.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exited.recv_timeout(remaining) {
                Ok(name) => {
                    if let Some(pos) = self.threads.iter().position(|(n, _)| *n == name) {
                        let (_, handle) = self.threads.swap_remove(pos);
                        if handle.join().is_err() {
                            tracing::warn!("{name} thread panicked");
                        }
                    }
                }
                Err(_) => {
                    for (name, _) in self.threads.drain(..) {
                        tracing::warn!(
                            "{name} did not exit within {CAPTURE_JOIN_TIMEOUT_MS}ms, detaching"
                        );
                    }
                }
            }
        }

        tracing::info!(
            "CaptureEngine stopped: {} packets seen, {} recorded, {} dropped",
            self.stats.seen.load(Ordering::Relaxed),
            self.stats.recorded.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        );
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn direction_mode(server_ip: Option<IpAddr>) -> String {
    match server_ip {
        Some(ip) => format!(" (server {ip})"),
        None => " (no server address, counting all traffic as outbound)".to_string(),
    }
}

fn run_reader(
    source: &mut dyn PacketSource,
    filter: Option<&CaptureFilter>,
    server_ip: Option<IpAddr>,
    events: &mpsc::SyncSender<TrafficEvent>,
    shutdown: &AtomicBool,
    stats: &CaptureStats,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let packet = match source.poll_packet() {
            Ok(Poll::Packet(packet)) => packet,
            Ok(Poll::Idle) => continue,
            Ok(Poll::Exhausted) => {
                tracing::info!("{} finished", source.describe());
                return;
            }
            Err(e) => {
                tracing::warn!("Packet capture failed: {e}. Continuing without captured traffic.");
                return;
            }
        };
        stats.seen.fetch_add(1, Ordering::Relaxed);

        match to_event(&packet, filter, server_ip) {
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping packet: {e}");
            }
        }
    }
}

fn run_ingest(
    events: &mpsc::Receiver<TrafficEvent>,
    aggregator: &Aggregator,
    shutdown: &AtomicBool,
    stats: &CaptureStats,
) {
    for event in events.iter() {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        aggregator.record(
            event.timestamp,
            &event.client,
            event.direction,
            event.bytes,
            &event.protocol,
        );
        stats.recorded.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::packet::tests::{build_ipv4_packet, ethernet_frame};
    use super::packet::LinkType;
    use super::pcap_file::tests::pcap_bytes;
    use super::*;
    use crate::core::{SnapshotMeta, TransportLayer};

    const SERVER: [u8; 4] = [192, 168, 1, 11];

    fn headers(src: [u8; 4], dst: [u8; 4]) -> PacketHeaders {
        PacketHeaders {
            src: IpAddr::from(src),
            dst: IpAddr::from(dst),
            layer: TransportLayer::Tcp,
            src_port: Some(51234),
            dst_port: Some(80),
        }
    }

    fn server() -> Option<IpAddr> {
        Some(IpAddr::from(SERVER))
    }

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        ethernet_frame(0x0800, &build_ipv4_packet(6, src, dst, sport, dport))
    }

    #[test]
    fn test_direction_from_server_is_outbound() {
        let h = headers(SERVER, [10, 0, 0, 2]);
        assert_eq!(
            resolve_direction(&h, server()),
            Some((Direction::Out, IpAddr::from([10, 0, 0, 2])))
        );
    }

    #[test]
    fn test_direction_to_server_is_inbound() {
        let h = headers([10, 0, 0, 3], SERVER);
        assert_eq!(
            resolve_direction(&h, server()),
            Some((Direction::In, IpAddr::from([10, 0, 0, 3])))
        );
    }

    #[test]
    fn test_unrelated_traffic_is_discarded() {
        let h = headers([10, 0, 0, 3], [10, 0, 0, 4]);
        assert_eq!(resolve_direction(&h, server()), None);
    }

    #[test]
    fn test_without_server_everything_is_outbound() {
        let h = headers([10, 0, 0, 3], [10, 0, 0, 4]);
        assert_eq!(
            resolve_direction(&h, None),
            Some((Direction::Out, IpAddr::from([10, 0, 0, 4])))
        );
    }

    #[test]
    fn test_default_filter_targets_server() {
        let config = CaptureConfig {
            server_ip: server(),
            ..Default::default()
        };
        let filter = config.resolve_filter().unwrap().unwrap();
        assert_eq!(filter.to_string(), "host 192.168.1.11");

        assert!(CaptureConfig::default().resolve_filter().unwrap().is_none());
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = CaptureConfig {
            server_ip: server(),
            filter: Some("tcp port 8080".into()),
            ..Default::default()
        };
        assert_eq!(config.resolve_filter().unwrap().unwrap().to_string(), "tcp port 8080");
    }

    #[test]
    fn test_malformed_filter_is_capture_error() {
        let config = CaptureConfig {
            filter: Some("host 300.1.1.1".into()),
            ..Default::default()
        };
        let err = config.resolve_filter().unwrap_err();
        assert!(matches!(err, CaptureError::Filter { .. }));
        assert_eq!(AppError::from(err).kind(), "Capture");
    }

    #[test]
    fn test_to_event_classifies_and_uses_wire_length() {
        let packet = RawPacket {
            timestamp: 42.5,
            link: LinkType::Ethernet,
            data: tcp_frame([10, 0, 0, 2], SERVER, 51234, 443),
            wire_len: 1514,
        };
        let event = to_event(&packet, None, server()).unwrap().unwrap();
        assert_eq!(
            event,
            TrafficEvent {
                timestamp: 42.5,
                client: "10.0.0.2".into(),
                direction: Direction::In,
                bytes: 1514,
                protocol: "HTTPS".into(),
            }
        );
    }

    #[test]
    fn test_to_event_respects_filter() {
        let packet = RawPacket {
            timestamp: 1.0,
            link: LinkType::Ethernet,
            data: tcp_frame([10, 0, 0, 2], SERVER, 51234, 22),
            wire_len: 60,
        };
        let filter = CaptureFilter::parse("not port 22").unwrap();
        assert_eq!(to_event(&packet, Some(&filter), server()).unwrap(), None);
    }

    #[test]
    fn test_to_event_reports_garbage() {
        let packet = RawPacket {
            timestamp: 1.0,
            link: LinkType::Ethernet,
            data: vec![0u8; 6],
            wire_len: 6,
        };
        assert!(to_event(&packet, None, server()).is_err());
    }

    #[test]
    fn test_missing_replay_file_fails_start() {
        let config = CaptureConfig {
            pcap: Some(PathBuf::from("/nonexistent/dir/capture.pcap")),
            ..Default::default()
        };
        let aggregator = Arc::new(Aggregator::new(5, 0, None));
        let err = CaptureEngine::start(config, aggregator).err().unwrap();
        assert!(format!("{err:#}").contains("cannot replay"));
    }

    #[test]
    fn test_replay_feeds_aggregator() {
        let inbound = tcp_frame([10, 0, 0, 2], SERVER, 51234, 80);
        let outbound = tcp_frame(SERVER, [10, 0, 0, 3], 40000, 22);
        let garbage = vec![0u8; 8];
        let unrelated = tcp_frame([10, 0, 0, 7], [10, 0, 0, 8], 1000, 2000);
        let bytes = pcap_bytes(
            1,
            &[
                (100, 0, &inbound),
                (100, 10, &outbound),
                (100, 20, &garbage),
                (100, 30, &unrelated),
            ],
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let aggregator = Arc::new(Aggregator::new(3600, 0, None));
        let config = CaptureConfig {
            server_ip: server(),
            pcap: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let mut engine = CaptureEngine::start(config, Arc::clone(&aggregator)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.stats().recorded.load(Ordering::Relaxed) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        engine.stop();

        assert_eq!(engine.stats().seen.load(Ordering::Relaxed), 4);
        assert_eq!(engine.stats().dropped.load(Ordering::Relaxed), 1);

        let snap = aggregator.peek_snapshot(&SnapshotMeta::default());
        assert_eq!(snap.n_clients, 2);
        assert_eq!(snap.pkt_count, 2);
        assert_eq!(snap.clients["10.0.0.2"].in_bytes, inbound.len() as u64);
        assert_eq!(snap.clients["10.0.0.2"].protocols["HTTP"].inbound, inbound.len() as u64);
        assert_eq!(snap.clients["10.0.0.3"].out_bytes, outbound.len() as u64);
        assert_eq!(snap.clients["10.0.0.3"].protocols["SSH"].outbound, outbound.len() as u64);
    }

    struct StuckSource;

    impl PacketSource for StuckSource {
        fn describe(&self) -> String {
            "stuck".into()
        }

        fn poll_packet(&mut self) -> Result<Poll, CaptureError> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(Poll::Idle)
        }
    }

    #[test]
    fn test_stop_joins_idle_threads_promptly() {
        let aggregator = Arc::new(Aggregator::new(5, 0, None));
        let mut engine =
            CaptureEngine::spawn(Box::new(StuckSource), None, None, aggregator).unwrap();
        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_millis(CAPTURE_JOIN_TIMEOUT_MS));
        assert!(engine.threads.is_empty());
    }
}
