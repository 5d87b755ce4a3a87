//! Orchestrator: wires capture, aggregation and emission together.
//!
//! `Orchestrator` owns the aggregator, the emitter and the optional capture
//! engine. Each tick is scheduled from the wall-clock end of the current
//! window, drains exactly one window and delivers it; a termination signal
//! ends the wait immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CaptureConfig, CaptureEngine};
use crate::config::{unix_now, Settings, TICK_SLACK_MS};
use crate::core::{Aggregator, Direction, Snapshot, SnapshotMeta};
use crate::error::AppError;
use crate::sink::Emitter;

/// Hostname reported when the OS does not provide one.
const UNKNOWN_HOST: &str = "unknown-host";

/// Synthetic traffic injected each tick in mock mode.
const MOCK_EVENTS: [(&str, Direction, u64, &str); 5] = [
    ("10.0.0.2", Direction::In, 1500, "HTTP"),
    ("10.0.0.2", Direction::Out, 700, "HTTP"),
    ("10.0.0.3", Direction::In, 400, "HTTPS"),
    ("10.0.0.4", Direction::Out, 250, "FTP"),
    ("10.0.0.3", Direction::Out, 180, "DNS"),
];

pub struct Orchestrator {
    aggregator: Arc<Aggregator>,
    emitter: Emitter,
    meta: SnapshotMeta,
    capture_config: Option<CaptureConfig>,
    capture: Option<CaptureEngine>,
    mock: bool,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        let emitter = Emitter::new(&settings.sink)?;
        let aggregator = Arc::new(Aggregator::new(
            settings.window_secs,
            settings.max_clients,
            settings.anonymizer,
        ));
        let meta = SnapshotMeta {
            host: Some(host_name()),
            iface: settings.iface.clone(),
            server_ip: settings.server_ip.map(|ip| ip.to_string()),
        };
        // --no-capture turns off the live socket only; a replay still runs.
        let wants_capture = !settings.no_capture || settings.pcap.is_some();
        let capture_config = wants_capture.then(|| CaptureConfig {
            server_ip: settings.server_ip,
            iface: settings.iface,
            filter: settings.filter,
            pcap: settings.pcap,
        });

        tracing::info!(
            "netpulse {} on {}: {}s windows, emitting to {}",
            env!("CARGO_PKG_VERSION"),
            meta.host.as_deref().unwrap_or(UNKNOWN_HOST),
            settings.window_secs,
            emitter.describe()
        );

        Ok(Self {
            aggregator,
            emitter,
            meta,
            capture_config,
            capture: None,
            mock: settings.mock,
        })
    }

    /// Start packet capture unless disabled. Failure leaves capture off.
    pub fn start_capture(&mut self) {
        let Some(config) = self.capture_config.clone() else {
            tracing::info!("Packet capture disabled (--no-capture)");
            return;
        };
        match CaptureEngine::start(config, Arc::clone(&self.aggregator)) {
            Ok(engine) => self.capture = Some(engine),
            Err(e) => {
                tracing::warn!(
                    "Packet capture unavailable: {e:#}. Continuing with zero captured traffic."
                );
            }
        }
    }

    /// Tick on every window boundary until SIGINT/SIGTERM, then shut down.
    pub async fn run(self) {
        self.run_until(shutdown_signal()).await;
    }

    async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        self.start_capture();
        tokio::pin!(shutdown);

        loop {
            let wait = self.until_window_end();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {
                    // Traffic may have rolled the window past this boundary
                    // during a slow delivery; wait for the new window's end.
                    if self.window_due() {
                        self.tick().await;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn until_window_end(&self) -> Duration {
        let remaining = self.aggregator.current_window_end() - unix_now();
        Duration::from_secs_f64(remaining.max(0.0))
    }

    fn window_due(&self) -> bool {
        let slack = Duration::from_millis(TICK_SLACK_MS).as_secs_f64();
        unix_now() + slack >= self.aggregator.current_window_end()
    }

    /// Drain the current window and deliver it.
    pub async fn tick(&self) -> Snapshot {
        if self.mock {
            let window_start = self.aggregator.current_window_end() - self.aggregator.width_secs();
            inject_mock_events(&self.aggregator, window_start);
        }

        let snapshot = self.aggregator.take_snapshot_and_advance(&self.meta);
        self.aggregator.skip_idle_windows(unix_now());

        if snapshot.is_empty() {
            tracing::debug!(
                "Window {:.0}-{:.0}: no traffic",
                snapshot.window_start,
                snapshot.window_end
            );
        } else {
            tracing::info!(
                "Window {:.0}-{:.0}: {} clients, in {}, out {}, {} packets",
                snapshot.window_start,
                snapshot.window_end,
                snapshot.n_clients,
                format_bytes_compact(snapshot.total_in),
                format_bytes_compact(snapshot.total_out),
                snapshot.pkt_count
            );
        }

        let report = self.emitter.deliver(&snapshot).await;
        if !report.is_success() {
            tracing::warn!(
                "Emission failed for window {:.0}: {report}. Continuing.",
                snapshot.window_start
            );
        }
        snapshot
    }

    async fn shutdown(mut self) {
        let pending = self.aggregator.peek_snapshot(&self.meta);
        tracing::info!(
            "Shutdown requested; discarding partial window with {} clients ({} packets, {})",
            pending.n_clients,
            pending.pkt_count,
            format_bytes_compact(pending.byte_count)
        );

        if let Some(mut engine) = self.capture.take() {
            tracing::info!("Stopping packet capture ({})...", engine.description());
            if let Err(e) = tokio::task::spawn_blocking(move || engine.stop()).await {
                tracing::warn!("Capture shutdown task failed: {e}");
            }
        }
        tracing::info!("netpulse stopped");
    }
}

/// Record the fixed synthetic events at `timestamp`.
pub fn inject_mock_events(aggregator: &Aggregator, timestamp: f64) {
    for (client, direction, bytes, protocol) in MOCK_EVENTS {
        aggregator.record(timestamp, client, direction, bytes, protocol);
    }
}

/// OS hostname, or [`UNKNOWN_HOST`].
pub fn host_name() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Format a byte count as a compact human-readable string.
pub fn format_bytes_compact(bytes: u64) -> String {
    let b = bytes as f64;
    if b < 1024.0 {
        format!("{bytes} B")
    } else if b < 1024.0 * 1024.0 {
        format!("{:.1} KB", b / 1024.0)
    } else if b < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", b / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", b / (1024.0 * 1024.0 * 1024.0))
    }
}
