//! Error classification for failed exchanges
//!
//! Turns a non-2xx response, a transport failure, or a token endpoint error
//! into the caller-facing `ApiError`. Only 401 is an authorization failure;
//! every other status is a server error and never triggers a refresh.

use portal_auth::Error as AuthError;
use transport::{ApiError, ApiResponse, ErrorKind, StatusCode, TransportError};

/// Whether the status means the bearer credential was not accepted.
pub fn is_authorization_failure(status: u16) -> bool {
    status == 401
}

/// Taxonomy entry for a failed (non-2xx) status.
pub fn classify_status(status: u16) -> ErrorKind {
    if is_authorization_failure(status) {
        ErrorKind::AuthExpired
    } else {
        ErrorKind::ServerError
    }
}

/// Normalize a failed response into an `ApiError` carrying its status.
pub fn classify_response(response: &ApiResponse) -> ApiError {
    normalize(classify_status(response.status), response.status, &response.body)
}

/// A failure below HTTP. Always `NetworkError`, never retried. The cause
/// (`timeout`, `connect`, ...) is kept in `details`.
pub fn transport_failure(err: &TransportError) -> ApiError {
    ApiError::network(err.to_string()).with_details(serde_json::json!({ "cause": err.label() }))
}

/// A refresh exchange that did not produce a usable token. Whatever the
/// cause, the session is over.
pub fn refresh_failure(err: &AuthError) -> ApiError {
    let error = ApiError::auth_expired(format!("session expired: {err}"));
    match err {
        AuthError::Rejected { status, .. } => {
            error.with_details(serde_json::json!({ "refreshStatus": status }))
        }
        _ => error,
    }
}

/// A login exchange failure. Unlike refresh, a rejected login is reported as
/// the server's answer (wrong password is not an expired session).
pub fn login_failure(err: AuthError) -> ApiError {
    match err {
        AuthError::Http(msg) => ApiError::network(msg),
        AuthError::Rejected { status, body } => {
            normalize(ErrorKind::ServerError, status, body.as_bytes())
        }
        AuthError::Validation(msg) => ApiError::validation(msg),
        other => ApiError::new(ErrorKind::ServerError, other.to_string()),
    }
}

pub(crate) fn normalize(kind: ErrorKind, status: u16, body: &[u8]) -> ApiError {
    let parsed = serde_json::from_slice::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(extract_message)
        .unwrap_or_else(|| reason_phrase(status));

    let mut error = ApiError::new(kind, message).with_status(status);
    if let Some(details) = parsed.as_ref().and_then(extract_details) {
        error = error.with_details(details);
    }
    error
}

fn extract_message(body: &serde_json::Value) -> Option<String> {
    let text = body
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
        })
        .or_else(|| body.get("error").and_then(|e| e.as_str()))?;
    Some(text.to_string())
}

fn extract_details(body: &serde_json::Value) -> Option<serde_json::Value> {
    body.get("details")
        .or_else(|| body.get("errors"))
        .filter(|d| !d.is_null())
        .cloned()
}

fn reason_phrase(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}
