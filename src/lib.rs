pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod services;
pub mod sink;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use cli::{Cli, LogLevel};
use config::{Settings, ANON_KEY_ENV};
use error::AppError;
use services::Orchestrator;

/// Parse the command line, run until SIGINT/SIGTERM, and report the exit code.
pub fn run() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in netpulse: {info}");
        default_hook(info);
    }));

    let cli = Cli::parse();

    // Held until exit so buffered file logs are flushed.
    let _log_guard = match init_tracing(cli.log_level, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("netpulse: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let settings = match Settings::from_cli(cli, std::env::var(ANON_KEY_ENV).ok()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netpulse-rt")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        match Orchestrator::new(settings) {
            Ok(orchestrator) => {
                orchestrator.run().await;
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("{e}");
                ExitCode::from(e.exit_code())
            }
        }
    })
}

/// `RUST_LOG` wins; otherwise `netpulse=<level>`. Logs go to stderr and,
/// when `log_file` is set, to that file without ANSI colors.
fn init_tracing(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, AppError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("netpulse={}", level.as_filter())));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(name)
                .build(dir)
                .map_err(|e| {
                    AppError::Config(format!("cannot open log file {}: {e}", path.display()))
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn split_log_path(path: &Path) -> Result<(&Path, String), AppError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            AppError::Config(format!("--log-file {} has no file name", path.display()))
        })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path_with_directory() {
        let (dir, name) = split_log_path(Path::new("/var/log/netpulse.log")).unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "netpulse.log");
    }

    #[test]
    fn test_split_log_path_bare_file_uses_cwd() {
        let (dir, name) = split_log_path(Path::new("netpulse.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "netpulse.log");
    }

    #[test]
    fn test_split_log_path_rejects_directory_only() {
        let err = split_log_path(Path::new("/")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
