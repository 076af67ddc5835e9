//! Per-request failures and their HTTP rendering
//!
//! Startup failures go through `anyhow` in `main`; everything that can fail
//! while serving a request ends up here and is rendered as
//! `{"error":{"code","message","details","request_id"}}`.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use transport::{ApiError, ErrorKind};

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The authenticated exchange with the campus API failed
    #[error(transparent)]
    Session(#[from] ApiError),

    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Session(e) => session_status(e),
            ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Session(e) => e.kind.code(),
            ProxyError::InvalidBody(_) => "INVALID_REQUEST",
        }
    }

    /// Label for `proxy_upstream_errors_total`.
    pub fn error_type(&self) -> String {
        match self {
            ProxyError::Session(e) => network_cause(e)
                .map(str::to_string)
                .unwrap_or_else(|| e.kind.code().to_ascii_lowercase()),
            ProxyError::InvalidBody(_) => "invalid_request".into(),
        }
    }

    pub fn render(self, request_id: &str) -> Response {
        let status = self.status();
        let (message, details) = match &self {
            ProxyError::Session(e) => (e.message.clone(), e.details.clone()),
            ProxyError::InvalidBody(_) => (self.to_string(), None),
        };
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": message,
                "details": details,
                "request_id": request_id,
            }
        });
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

fn network_cause(e: &ApiError) -> Option<&str> {
    if e.kind != ErrorKind::NetworkError {
        return None;
    }
    e.details.as_ref()?.get("cause")?.as_str()
}

fn session_status(e: &ApiError) -> StatusCode {
    match e.kind {
        ErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
        ErrorKind::ServerError => e
            .status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY),
        ErrorKind::NetworkError if network_cause(e) == Some("timeout") => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ErrorKind::NetworkError | ErrorKind::ValidationError => StatusCode::BAD_GATEWAY,
    }
}
