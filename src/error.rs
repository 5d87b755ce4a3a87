//! Unified application error type.
//!
//! `AppError` is returned by startup validation and by every component that
//! surfaces a failure to the orchestrator. It serializes as
//! `{ "kind": "...", "message": "..." }` so a presentation layer consuming the
//! snapshots can distinguish error categories.

use serde::ser::SerializeStruct;

/// Application-level error.
///
/// Each variant maps to a distinct failure domain.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Invalid startup configuration (malformed sink URL, bad log target).
    #[error("{0}")]
    Config(String),

    /// Errors from the packet capture adapter.
    #[error("{0}")]
    Capture(String),

    /// Errors from an emission destination.
    #[error("{0}")]
    Sink(String),

    /// I/O and OS-level errors.
    #[error("{0}")]
    Io(String),

    /// Invalid or missing user input.
    #[error("{0}")]
    InvalidInput(String),
}

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "Config",
            AppError::Capture(_) => "Capture",
            AppError::Sink(_) => "Sink",
            AppError::Io(_) => "Io",
            AppError::InvalidInput(_) => "InvalidInput",
        }
    }

    /// Process exit code for an error that aborts startup.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::InvalidInput(_) => 2,
            _ => 1,
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Sink(err.to_string())
    }
}
