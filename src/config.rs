//! Centralized runtime constants and validated settings.
//!
//! All tunable intervals, timeouts and capacities live here so they can be
//! found and adjusted in one place rather than scattered across modules.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::cli::{Cli, LogLevel};
use crate::core::{Anonymizer, KeySource};
use crate::error::AppError;
use crate::sink::SinkConfig;

/// Schema version stamped into every emitted snapshot.
pub const PAYLOAD_VERSION: &str = "2.1.0";

/// Default window width / emission interval (seconds).
pub const DEFAULT_INTERVAL_SECS: f64 = 5.0;

/// Smallest accepted window width (seconds). Lower values are clamped.
pub const MIN_INTERVAL_SECS: f64 = 1.0;

/// Largest accepted window width (seconds). Larger values are rejected.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// A window counts as due this close to its end, absorbing drift between
/// the runtime timer and the wall clock (milliseconds).
pub const TICK_SLACK_MS: u64 = 50;

/// Default timeout for one POST attempt (seconds).
pub const DEFAULT_POST_TIMEOUT_SECS: f64 = 10.0;

/// Default number of extra POST attempts after a transport failure.
pub const DEFAULT_POST_RETRIES: u32 = 2;

/// Delay before the first POST retry; doubles on every further retry (milliseconds).
pub const POST_BACKOFF_BASE_MS: u64 = 800;

/// How long `CaptureEngine::stop` waits for capture threads to exit (milliseconds).
pub const CAPTURE_JOIN_TIMEOUT_MS: u64 = 2000;

/// Read timeout of the live capture socket, bounding stop-flag latency (milliseconds).
pub const CAPTURE_POLL_TIMEOUT_MS: u64 = 200;

/// Events buffered between the capture reader and the aggregation worker.
pub const CAPTURE_QUEUE_CAPACITY: usize = 65_536;

/// Largest frame read from a live socket (bytes).
pub const CAPTURE_SNAPLEN: usize = 65_535;

/// Environment variable consulted for the anonymization key.
pub const ANON_KEY_ENV: &str = "ANON_KEY";

/// Hash bytes kept per anonymized client token.
pub const ANON_TOKEN_BYTES: usize = 12;

/// Current Unix time in fractional seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Validated runtime configuration derived from the command line.
#[derive(Debug)]
pub struct Settings {
    pub server_ip: Option<IpAddr>,
    pub iface: Option<String>,
    pub filter: Option<String>,
    pub pcap: Option<PathBuf>,
    pub window_secs: u64,
    pub max_clients: usize,
    pub sink: SinkConfig,
    pub anonymizer: Option<Anonymizer>,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub mock: bool,
    pub no_capture: bool,
}

impl Settings {
    /// Validate `cli`. `env_key` is the value of [`ANON_KEY_ENV`], if set.
    ///
    /// Out-of-range intervals are clamped with a warning; malformed URLs,
    /// addresses and timeouts are rejected.
    pub fn from_cli(cli: Cli, env_key: Option<String>) -> Result<Self, AppError> {
        let window_secs = resolve_window_secs(cli.interval)?;

        let post_url = cli.post.as_deref().map(validate_url).transpose()?;

        if !(cli.post_timeout.is_finite() && cli.post_timeout > 0.0) {
            return Err(AppError::Config(format!(
                "--post-timeout must be a positive number of seconds, got {}",
                cli.post_timeout
            )));
        }

        let server_ip = cli
            .server_ip
            .as_deref()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| AppError::InvalidInput(format!("invalid --server-ip: {s:?}")))
            })
            .transpose()?;

        if cli.no_capture && !cli.mock && cli.pcap.is_none() {
            tracing::warn!("--no-capture without --mock or --pcap: no traffic will be recorded");
        }

        let anonymizer = cli.anon.then(|| {
            let (anon, source) =
                Anonymizer::from_sources(cli.anon_key.as_deref(), env_key.as_deref());
            let origin = match source {
                KeySource::Explicit => "key from --anon-key".to_string(),
                KeySource::Environment => format!("key from ${ANON_KEY_ENV}"),
                KeySource::Random => "a random per-run key".to_string(),
            };
            tracing::info!("Anonymizing clients with {origin}");
            anon
        });

        Ok(Self {
            server_ip,
            iface: cli.iface,
            filter: cli.filter,
            pcap: cli.pcap,
            window_secs,
            max_clients: cli.max_clients,
            sink: SinkConfig {
                post_url,
                post_timeout: Duration::from_secs_f64(cli.post_timeout),
                post_retries: cli.post_retries,
                file: cli.file,
                file_append: cli.file_append,
            },
            anonymizer,
            log_level: cli.log_level,
            log_file: cli.log_file,
            mock: cli.mock,
            no_capture: cli.no_capture,
        })
    }
}

/// Clamp a low interval, reject an oversized one, and truncate to whole seconds.
pub fn resolve_window_secs(interval: f64) -> Result<u64, AppError> {
    if interval > MAX_INTERVAL_SECS {
        return Err(AppError::Config(format!(
            "--interval must be at most {MAX_INTERVAL_SECS}s, got {interval}"
        )));
    }
    let interval = if interval.is_finite() && interval >= MIN_INTERVAL_SECS {
        interval
    } else {
        tracing::warn!("--interval too low ({interval:.2}s), using {MIN_INTERVAL_SECS}s");
        MIN_INTERVAL_SECS
    };
    Ok(interval.trunc() as u64)
}

/// Accept only absolute `http`/`https` URLs with a host.
pub fn validate_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw).map_err(|e| AppError::Config(format!("invalid URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
        return Err(AppError::Config(format!(
            "invalid URL {raw:?}: expected http(s)://host[:port]/path"
        )));
    }
    Ok(url)
}
