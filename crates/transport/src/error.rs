//! Error taxonomy surfaced to callers of the authenticated transport

use std::fmt;

use serde::{Deserialize, Serialize};

/// The four ways a request can fail, as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Session is gone: refresh failed, a replayed request was rejected again,
    /// or there was never a session. The caller must re-authenticate.
    AuthExpired,
    /// No HTTP response was obtained
    NetworkError,
    /// Non-2xx, non-authorization status from the server
    ServerError,
    /// Malformed refresh/login response, or an unserializable request
    ValidationError,
}

impl ErrorKind {
    /// Wire tag used in the propagated error shape.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuthExpired => "AUTH_EXPIRED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Normalized error handed back from `request()`.
///
/// Serializes as `{"code": "...", "message": "...", "status"?: n, "details"?: ...}`.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ApiError {
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream HTTP status, when one was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthExpired, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message).with_status(status)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Failures below HTTP: no status line was received.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// Short cause label for error details and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Request(_) => "request",
            TransportError::Body(_) => "body",
        }
    }
}
