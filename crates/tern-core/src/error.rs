//! Backend error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories of backend failures for consistent handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Missing credentials, endpoint or binary. Reported immediately,
    /// never retried.
    Config,
    /// The stream or subprocess failed mid-flight.
    Transport,
    /// A backend record could not be decoded.
    Parse,
    /// The provider reported an error of its own.
    Api,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Config => write!(f, "config"),
            BackendErrorKind::Transport => write!(f, "transport"),
            BackendErrorKind::Parse => write!(f, "parse"),
            BackendErrorKind::Api => write!(f, "api"),
        }
    }
}

/// Structured error from a backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendError {
    /// Error category.
    pub kind: BackendErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g. raw error body, stderr tail).
    pub details: Option<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Config, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transport, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Parse, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Api, message)
    }

    /// Creates a transport error from an HTTP status and response body,
    /// extracting a cleaner message from a JSON error envelope when present.
    pub fn http_status(status: u16, body: &str) -> Self {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(body)
            && let Some(error_obj) = json.get("error")
            && let Some(msg) = error_obj.get("message").and_then(|v| v.as_str())
        {
            return Self {
                kind: BackendErrorKind::Transport,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }
        Self {
            kind: BackendErrorKind::Transport,
            message: format!("HTTP {status}"),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Marker error for operator-initiated stops. Not a failure: the turn
/// controller maps it to a clean `Cancelled` outcome.
#[derive(Debug)]
pub struct StopRequested;

impl fmt::Display for StopRequested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Turn was interrupted")
    }
}

impl std::error::Error for StopRequested {}
