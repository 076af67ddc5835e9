//! Send/receive primitive for the campus API
//!
//! Defines the `Transport` trait that every network call in the workspace goes
//! through: domain requests, their replays after a token refresh, and the
//! refresh/login exchanges themselves. `HttpTransport` is the reqwest-backed
//! implementation; tests substitute scripted fakes.
//!
//! Also home to the normalized error shape (`ApiError` tagged with an
//! `ErrorKind`) that the session layer hands back to callers.

pub mod error;
pub mod http;

pub use error::{ApiError, ErrorKind, TransportError};
pub use http::HttpTransport;

pub use reqwest::{Method, StatusCode};
pub use reqwest::header::{self, HeaderMap, HeaderValue};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;

/// One outgoing request, cheap to clone so it can be replayed after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path and query relative to the transport's base URL (`/api/meals?day=mon`)
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Serialize `body` as the JSON payload and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::validation(format!("request body is not serializable: {e}")))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The bearer credential currently attached, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// A fully-read response. Non-2xx statuses are still `Ok` at this layer;
/// classification happens in the session layer.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as text, lossily decoded (for logging and error messages).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The network primitive consumed by the session layer.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Issue one request and read the full response.
    ///
    /// Returns `Err` only when no HTTP response was obtained (connect failure,
    /// timeout, truncated body). Error statuses come back as `Ok`.
    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_sets_content_type() {
        let request = ApiRequest::post("/auth/refresh")
            .json(&serde_json::json!({"refreshToken": "rt_1"}))
            .unwrap();
        assert_eq!(
            request.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["refreshToken"], "rt_1");
    }

    #[test]
    fn bearer_reads_authorization_header() {
        let mut request = ApiRequest::get("/api/attendance");
        assert!(request.bearer().is_none());
        request.headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer T1"),
        );
        assert_eq!(request.bearer(), Some("T1"));
    }

    #[test]
    fn response_success_range() {
        assert!(ApiResponse::new(200, "").is_success());
        assert!(ApiResponse::new(204, "").is_success());
        assert!(!ApiResponse::new(301, "").is_success());
        assert!(!ApiResponse::new(401, "").is_success());
    }

    #[test]
    fn response_json_and_text() {
        let response = ApiResponse::new(200, r#"{"balance":1250}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["balance"], 1250);
        assert_eq!(response.text(), r#"{"balance":1250}"#);
    }
}
