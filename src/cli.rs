//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config;

#[derive(Debug, Parser)]
#[command(
    name = "netpulse",
    version,
    about = "Capture traffic, aggregate it per client in fixed windows, and deliver JSON snapshots"
)]
pub struct Cli {
    /// Address of the monitored server; decides in/out direction
    #[arg(long)]
    pub server_ip: Option<String>,

    /// Capture interface (e.g. eth0)
    #[arg(long)]
    pub iface: Option<String>,

    /// Capture filter, e.g. 'host 192.168.1.11 and (tcp port 8080 or icmp)'
    #[arg(long, visible_alias = "bpf")]
    pub filter: Option<String>,

    /// Replay packets from a pcap file instead of capturing live
    #[arg(long, value_name = "FILE")]
    pub pcap: Option<PathBuf>,

    /// Window width and emission interval in seconds
    #[arg(long, default_value_t = config::DEFAULT_INTERVAL_SECS)]
    pub interval: f64,

    /// Keep only the N clients with the most traffic (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_clients: usize,

    /// URL to POST each snapshot to
    #[arg(long, value_name = "URL")]
    pub post: Option<String>,

    /// POST timeout in seconds
    #[arg(long, default_value_t = config::DEFAULT_POST_TIMEOUT_SECS)]
    pub post_timeout: f64,

    /// Extra POST attempts on transport failure (exponential backoff)
    #[arg(long, default_value_t = config::DEFAULT_POST_RETRIES)]
    pub post_retries: u32,

    /// Write each snapshot to this file (overwritten every window)
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Append one JSON document per line instead of overwriting
    #[arg(long, requires = "file")]
    pub file_append: bool,

    /// Replace client addresses with keyed hashes
    #[arg(long)]
    pub anon: bool,

    /// Anonymization key (falls back to $ANON_KEY, then a random key)
    #[arg(long, requires = "anon")]
    pub anon_key: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Inject synthetic events every window
    #[arg(long)]
    pub mock: bool,

    /// Do not start packet capture
    #[arg(long)]
    pub no_capture: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["netpulse"]);
        assert_eq!(cli.interval, config::DEFAULT_INTERVAL_SECS);
        assert_eq!(cli.post_retries, config::DEFAULT_POST_RETRIES);
        assert_eq!(cli.max_clients, 0);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert!(!cli.file_append);
        assert!(!cli.anon);
    }

    #[test]
    fn test_bpf_alias_sets_filter() {
        let cli = Cli::parse_from(["netpulse", "--bpf", "tcp port 80"]);
        assert_eq!(cli.filter.as_deref(), Some("tcp port 80"));
    }

    #[test]
    fn test_file_append_requires_file() {
        assert!(Cli::try_parse_from(["netpulse", "--file-append"]).is_err());
        assert!(
            Cli::try_parse_from(["netpulse", "--file", "out.ndjson", "--file-append"]).is_ok()
        );
    }

    #[test]
    fn test_full_surface_parses() {
        let cli = Cli::parse_from([
            "netpulse",
            "--server-ip",
            "10.0.0.1",
            "--iface",
            "eth0",
            "--interval",
            "10",
            "--max-clients",
            "20",
            "--post",
            "http://localhost:8000/api/ingest",
            "--post-timeout",
            "3.5",
            "--post-retries",
            "4",
            "--anon",
            "--anon-key",
            "k",
            "--log-level",
            "debug",
            "--mock",
            "--no-capture",
        ]);
        assert_eq!(cli.server_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(cli.max_clients, 20);
        assert_eq!(cli.post_retries, 4);
        assert_eq!(cli.log_level.as_filter(), "debug");
        assert!(cli.mock && cli.no_capture && cli.anon);
    }
}
