//! Campus Portal Proxy
//!
//! Single-binary session sidecar for the campus portal web front end:
//! 1. Owns the one access/refresh token pair (login, logout, status)
//! 2. Listens for incoming requests
//! 3. Attaches the bearer token and recovers from expired tokens with a
//!    single shared refresh
//! 4. Proxies to the campus API

mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use portal_auth::TokenStore;
use portal_session::{AuthClient, SessionEvent, spawn_refresh_task};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::HttpTransport;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::error::ProxyError;
use crate::proxy::{ProxyState, ServiceMetrics};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit layer caps simultaneous requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session_handler))
        .route("/session/login", post(login_handler))
        .route("/session/logout", post(logout_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting campus-portal-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        token_file = ?config.session.token_file,
        proactive_refresh = config.session.proactive_refresh,
        "configuration loaded"
    );

    let store = match &config.session.token_file {
        Some(path) => TokenStore::load(path.clone())
            .await
            .with_context(|| format!("failed to load token file {}", path.display()))?,
        None => {
            warn!("no token_file configured, the session will not survive a restart");
            TokenStore::in_memory()
        }
    };
    info!(logged_in = store.is_logged_in().await, "token store ready");

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport = HttpTransport::new(
        http_client,
        config.proxy.upstream_url.clone(),
        Duration::from_secs(config.proxy.timeout_secs),
    );
    let client = Arc::new(AuthClient::new(
        Arc::new(transport),
        Arc::new(store),
        config.session.settings(),
    ));

    tokio::spawn(log_session_events(client.subscribe()));

    let refresh_task = config.session.proactive_refresh.then(|| {
        spawn_refresh_task(
            client.clone(),
            Duration::from_secs(config.session.refresh_interval_secs),
            Duration::from_secs(config.session.refresh_threshold_secs),
        )
    });

    let service_metrics = ServiceMetrics::new();
    let in_flight = service_metrics.in_flight.clone();

    let app_state = AppState {
        proxy: ProxyState {
            client,
            metrics: service_metrics,
        },
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, so the server
    // is told to drain first and then raced against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    if let Some(task) = refresh_task {
        task.abort();
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Mirror session lifecycle events into the log.
async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Expired { reason }) => {
                warn!(event = "expired", %reason, "session expired, login required");
            }
            Ok(event) => info!(event = event.label(), "session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Always 200: a logged-out session is a normal state, not an outage.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let body = serde_json::json!({
        "status": "healthy",
        "logged_in": state.proxy.client.token_store().is_logged_in().await,
        "uptime_seconds": metrics.started_at.elapsed().as_secs(),
        "requests_served": metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn session_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.proxy.client.status().await)
}

/// Forward the caller's credentials to the login endpoint and keep the tokens.
async fn login_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    let credentials: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return ProxyError::InvalidBody(e.to_string()).render(&request_id),
    };

    match state.proxy.client.login(&credentials).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "login failed");
            ProxyError::Session(e).render(&request_id)
        }
    }
}

async fn logout_handler(State(state): State<AppState>) -> StatusCode {
    state.proxy.client.logout().await;
    StatusCode::NO_CONTENT
}

/// Catch-all handler that proxies every other request to the campus API.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(&state.proxy, request, new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
