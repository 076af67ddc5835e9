//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers and any caller
//! credentials, and forwards them through the session's `AuthClient`, which
//! attaches the managed bearer token and recovers from expired tokens.
//! Upstream 2xx responses are returned verbatim; failures are rendered as
//! the JSON error envelope.

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use portal_session::AuthClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};
use transport::ApiRequest;

use crate::error::ProxyError;
use crate::metrics;

/// Maximum accepted inbound body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request counters shared by the proxy handler and the health endpoint.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being forwarded; reported when the drain times out.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Decrements `in_flight` when the request finishes, however it finishes.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: Arc<AuthClient>,
    pub metrics: ServiceMetrics,
}

/// Forward an inbound request to the campus API with the session's credentials.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.metrics.in_flight);
    let started = Instant::now();

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return fail(state, ProxyError::InvalidBody(e.to_string()), &request_id, &method, started);
        }
    };

    let mut outgoing = ApiRequest::new(method.clone(), path);
    outgoing.headers = headers;
    if !body.is_empty() {
        outgoing = outgoing.with_body(body);
    }

    match state.client.request(outgoing).await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
            let mut response = Response::builder().status(status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) && name != header::CONTENT_LENGTH {
                    response = response.header(name, value);
                }
            }
            debug!(status = upstream.status, "forwarded");
            metrics::record_request(
                upstream.status,
                method.as_str(),
                started.elapsed().as_secs_f64(),
            );
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error!(error = %e, "failed to build response");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
        Err(e) => fail(state, ProxyError::Session(e), &request_id, &method, started),
    }
}

fn fail(
    state: &ProxyState,
    err: ProxyError,
    request_id: &str,
    method: &axum::http::Method,
    started: Instant,
) -> Response {
    state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    let status = err.status();
    metrics::record_upstream_error(&err.error_type());
    metrics::record_request(status.as_u16(), method.as_str(), started.elapsed().as_secs_f64());
    warn!(status = status.as_u16(), code = err.code(), error = %err, "request failed");
    err.render(request_id)
}

/// Inbound headers minus hop-by-hop, `Host`, `Content-Length`, and any caller
/// `Authorization` (the session supplies its own).
pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str())
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
