//! Network destination: JSON POST with bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::config::POST_BACKOFF_BASE_MS;
use crate::error::AppError;

/// Longest response body kept in a rejection report.
const MAX_BODY_CHARS: usize = 512;

/// Why one POST attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PostError {
    /// The collector answered with a non-2xx status. Never retried.
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The request never got an answer (timeout, refused, DNS).
    #[error("transport error: {0}")]
    Transport(String),
}

impl PostError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PostError::Transport(_))
    }
}

/// Run `send` until it succeeds, fails with a rejection, or `retries` extra
/// attempts have been used. The delay before retry `k` is `backoff_base * 2^(k-1)`.
///
/// Returns the number of attempts made on success.
pub async fn post_with_retry<F, Fut>(
    mut send: F,
    retries: u32,
    backoff_base: Duration,
) -> Result<u32, PostError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PostError>>,
{
    let mut attempt = 1;
    loop {
        match send().await {
            Ok(()) => return Ok(attempt),
            Err(e) if e.is_retryable() && attempt <= retries => {
                let delay = backoff_base * 2u32.saturating_pow(attempt - 1);
                tracing::debug!("POST attempt {attempt} failed: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::debug!("POST attempt {attempt} failed: {e}; giving up");
                return Err(e);
            }
        }
    }
}

/// A configured collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: Url,
    retries: u32,
    backoff_base: Duration,
}

impl HttpSink {
    pub fn new(url: Url, timeout: Duration, retries: u32) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("netpulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url,
            retries,
            backoff_base: Duration::from_millis(POST_BACKOFF_BASE_MS),
        })
    }

    pub fn with_backoff(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST `payload`, retrying transport failures.
    pub async fn deliver(&self, payload: &[u8]) -> Result<u32, PostError> {
        post_with_retry(move || self.post_once(payload), self.retries, self.backoff_base).await
    }

    async fn post_once(&self, payload: &[u8]) -> Result<(), PostError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| PostError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_BODY_CHARS)
            .collect();
        tracing::debug!("{} answered {status}: {body}", self.url);
        Err(PostError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
