//! Snapshot emission.
//!
//! [`Emitter::deliver`] serializes a snapshot once and hands the same bytes to
//! every configured destination. Destinations run concurrently and fail
//! independently; the [`DeliveryReport`] lists what went wrong.

pub mod file;
pub mod http;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use url::Url;

use crate::core::Snapshot;
use crate::error::AppError;
use crate::sink::http::HttpSink;

/// Destination settings, validated at startup.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub post_url: Option<Url>,
    pub post_timeout: Duration,
    pub post_retries: u32,
    pub file: Option<PathBuf>,
    pub file_append: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Http,
    File,
    Console,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Destination::Http => "http",
            Destination::File => "file",
            Destination::Console => "console",
        })
    }
}

/// Per-destination outcome of one delivery.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<Destination>,
    pub failures: Vec<(Destination, AppError)>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, destination: Destination, result: Result<(), AppError>) {
        match result {
            Ok(()) => self.delivered.push(destination),
            Err(e) => self.failures.push((destination, e)),
        }
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "delivered to {} destination(s)", self.delivered.len());
        }
        let failed: Vec<String> = self
            .failures
            .iter()
            .map(|(dest, err)| format!("{dest}: {err}"))
            .collect();
        f.write_str(&failed.join("; "))
    }
}

pub struct Emitter {
    http: Option<HttpSink>,
    file: Option<PathBuf>,
    append: bool,
}

impl Emitter {
    pub fn new(config: &SinkConfig) -> Result<Self, AppError> {
        let http = config
            .post_url
            .clone()
            .map(|url| HttpSink::new(url, config.post_timeout, config.post_retries))
            .transpose()?;
        Ok(Self {
            http,
            file: config.file.clone(),
            append: config.file_append,
        })
    }

    #[cfg(test)]
    fn with_http(mut self, sink: HttpSink) -> Self {
        self.http = Some(sink);
        self
    }

    /// Human-readable list of active destinations, for the startup log.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(http) = &self.http {
            parts.push(format!("POST {}", http.url()));
        }
        if let Some(path) = &self.file {
            let mode = if self.append { "append" } else { "overwrite" };
            parts.push(format!("file {} ({mode})", path.display()));
        }
        if parts.is_empty() {
            parts.push("stdout".to_string());
        }
        parts.join(", ")
    }

    /// Deliver `snapshot` to every destination. Never fails as a whole;
    /// inspect the report instead.
    pub async fn deliver(&self, snapshot: &Snapshot) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                let err = AppError::Sink(format!("failed to serialize snapshot: {e}"));
                let destination = if self.http.is_some() {
                    Destination::Http
                } else if self.file.is_some() {
                    Destination::File
                } else {
                    Destination::Console
                };
                report.failures.push((destination, err));
                return report;
            }
        };

        if self.http.is_none() && self.file.is_none() {
            report.record(Destination::Console, write_console(&payload).await);
            return report;
        }

        let post = async {
            match &self.http {
                Some(sink) => Some(
                    sink.deliver(&payload)
                        .await
                        .map(|attempts| {
                            if attempts > 1 {
                                tracing::debug!("POST succeeded after {attempts} attempts");
                            }
                        })
                        .map_err(|e| AppError::Sink(format!("POST {}: {e}", sink.url()))),
                ),
                None => None,
            }
        };
        let write = async {
            match &self.file {
                Some(path) => Some(
                    file::write_snapshot(path, &payload, self.append)
                        .await
                        .map_err(|e| AppError::Io(format!("{}: {e}", path.display()))),
                ),
                None => None,
            }
        };

        let (posted, written) = tokio::join!(post, write);
        if let Some(result) = posted {
            report.record(Destination::Http, result);
        }
        if let Some(result) = written {
            report.record(Destination::File, result);
        }
        report
    }
}

async fn write_console(payload: &[u8]) -> Result<(), AppError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(payload).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
