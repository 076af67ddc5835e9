//! Authenticated request pipeline and session operations

use std::sync::Arc;
use std::time::Duration;

use portal_auth::{AccessToken, AuthEndpoints, DEFAULT_REFRESH_TIMEOUT_SECS, TokenStore};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use transport::{ApiError, ApiRequest, ApiResponse, Transport};

use crate::classify;
use crate::coordinator::{RefreshCoordinator, RefreshState};
use crate::events::{self, SessionEvent};
use crate::interceptor::{self, Disposition};

/// Tunables for an `AuthClient`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoints: AuthEndpoints,
    /// Upper bound on one refresh exchange; expiry counts as a refresh failure.
    pub refresh_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoints: AuthEndpoints::default(),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
        }
    }
}

/// Point-in-time view of the session. Never carries token values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub logged_in: bool,
    /// Unix seconds, when the access token encodes an expiry
    pub access_expires_at: Option<u64>,
    pub refreshing: bool,
}

/// The one entry point domain code uses to talk to the campus API.
///
/// Every request gets the stored bearer token. A first 401 is recovered
/// through the shared `RefreshCoordinator` and the request is replayed once;
/// every other failure is surfaced as an `ApiError`.
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    coordinator: RefreshCoordinator,
    endpoints: AuthEndpoints,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthClient {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<TokenStore>, settings: SessionSettings) -> Self {
        let events = events::channel();
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            settings.endpoints.clone(),
            settings.refresh_timeout,
            events.clone(),
        );
        debug!(transport = transport.id(), "auth client initialized");
        Self {
            transport,
            store,
            coordinator,
            endpoints: settings.endpoints,
            events,
        }
    }

    /// Send `request` with the session's credentials.
    ///
    /// Returns the 2xx response unchanged, or the classified failure. A 401
    /// after the single replay is `AUTH_EXPIRED` and ends the session.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut token = self.store.access_token().await;
        let mut retried = false;

        loop {
            let mut attempt = request.clone();
            interceptor::authorize(&mut attempt, token.as_ref());

            let response = self.transport.send(attempt).await.map_err(|e| {
                warn!(error = %e, retried, "transport failure");
                classify::transport_failure(&e)
            })?;
            let status = response.status;

            match interceptor::inspect(response, retried) {
                Disposition::Deliver(response) => return Ok(response),
                Disposition::Reject(error) => {
                    debug!(status, code = error.kind.code(), retried, "request failed");
                    return Err(error);
                }
                Disposition::Expire(error) => {
                    warn!(status, "refreshed token rejected, ending session");
                    if let Some(token) = &token {
                        self.expire(token, &error).await;
                    }
                    return Err(error);
                }
                Disposition::Recover => {
                    debug!(status, "access token rejected, recovering session");
                    token = Some(self.coordinator.recover(token.as_ref()).await?);
                    retried = true;
                }
            }
        }
    }

    /// Clear the session the replay was sent with. A login or refresh that
    /// already replaced it is left alone.
    async fn expire(&self, token: &AccessToken, error: &ApiError) {
        match self.store.replace_if(token, None).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(error = %e, "failed to persist cleared tokens"),
        }
        info!("session expired, re-authentication required");
        events::emit(
            &self.events,
            SessionEvent::Expired {
                reason: error.message.clone(),
            },
        );
    }

    /// Exchange credentials for a fresh token pair and store it.
    pub async fn login(&self, credentials: &serde_json::Value) -> Result<(), ApiError> {
        let pair = portal_auth::login(self.transport.as_ref(), &self.endpoints, credentials)
            .await
            .map_err(classify::login_failure)?;

        if let Err(e) = self.store.set(pair).await {
            warn!(error = %e, "failed to persist tokens after login, keeping them in memory");
        }
        info!("logged in");
        events::emit(&self.events, SessionEvent::LoggedIn);
        Ok(())
    }

    /// Forget the session. Requests keep flowing, unauthenticated.
    pub async fn logout(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to persist cleared tokens");
        }
        info!("logged out");
        events::emit(&self.events, SessionEvent::LoggedOut);
    }

    pub async fn status(&self) -> SessionStatus {
        let token = self.store.access_token().await;
        SessionStatus {
            logged_in: token.is_some(),
            access_expires_at: token.as_ref().and_then(|t| t.expires_at()),
            refreshing: self.coordinator.state().await == RefreshState::Refreshing,
        }
    }

    /// Lifecycle notifications from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, wait_until};
    use portal_auth::{AccessToken, LOGIN_PATH, REFRESH_PATH, RefreshToken, TokenPair};
    use transport::{ErrorKind, HeaderValue, TransportError, header};

    const REFRESHED: &str = r#"{"accessToken":"T2"}"#;

    fn t1_session() -> Arc<TokenStore> {
        Arc::new(TokenStore::in_memory_with(TokenPair::new(
            AccessToken::new("T1"),
            RefreshToken::new("R1"),
        )))
    }

    fn client(transport: Arc<ScriptedTransport>, store: Arc<TokenStore>) -> Arc<AuthClient> {
        Arc::new(AuthClient::new(transport, store, SessionSettings::default()))
    }

    #[tokio::test]
    async fn concurrent_expired_requests_share_one_refresh() {
        let (transport, gate) = ScriptedTransport::campus("T2", 200, REFRESHED).gated();
        let transport = Arc::new(transport);
        let store = t1_session();
        let client = client(transport.clone(), store.clone());

        let mut handles = Vec::new();
        for path in ["/api/attendance", "/api/meals", "/api/events"] {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.request(ApiRequest::get(path)).await
            }));
        }

        while client.coordinator().pending().await < 3 {
            tokio::task::yield_now().await;
        }
        assert!(client.status().await.refreshing);
        gate.add_permits(1);

        for (handle, path) in handles
            .into_iter()
            .zip(["/api/attendance", "/api/meals", "/api/events"])
        {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, 200);
            let body: serde_json::Value = response.json().unwrap();
            assert_eq!(body["path"], path);
        }

        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.calls_with_bearer(Some("T1")), 3);
        assert_eq!(transport.calls_with_bearer(Some("T2")), 3);

        let pair = store.get().await.unwrap();
        assert_eq!(pair.access.as_str(), "T2");
        assert_eq!(pair.refresh.as_str(), "R1");
    }

    #[tokio::test]
    async fn rejected_refresh_ends_the_session() {
        let transport = Arc::new(ScriptedTransport::campus(
            "T2",
            400,
            r#"{"message":"refresh token expired"}"#,
        ));
        let store = t1_session();
        let client = client(transport.clone(), store.clone());
        let mut events = client.subscribe();

        let err = client.request(ApiRequest::get("/api/wallet")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert!(store.get().await.is_none());
        assert_eq!(events.recv().await.unwrap().label(), "expired");

        // Next request goes out unauthenticated and does not refresh again
        let err = client.request(ApiRequest::get("/api/schedule")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(transport.calls_with_bearer(None), 1);
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn replayed_request_is_never_retried_twice() {
        // The API refuses every token, even freshly refreshed ones
        let transport = Arc::new(ScriptedTransport::campus("never", 200, REFRESHED));
        let store = t1_session();
        let client = client(transport.clone(), store.clone());
        let mut events = client.subscribe();

        let err = client.request(ApiRequest::get("/api/meals")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(err.status, Some(401));
        assert!(err.message.contains("after token refresh"), "got: {}", err.message);

        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.calls_with_bearer(Some("T1")), 1);
        assert_eq!(transport.calls_with_bearer(Some("T2")), 1);
        assert!(store.get().await.is_none());

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
        match events.recv().await.unwrap() {
            SessionEvent::Expired { reason } => assert!(reason.contains("after token refresh")),
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_session_is_not_refreshed_again() {
        let transport = Arc::new(ScriptedTransport::campus("never", 200, REFRESHED));
        let store = t1_session();
        let client = client(transport.clone(), store.clone());

        let err = client.request(ApiRequest::get("/api/meals")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert!(!client.status().await.logged_in);

        // Unauthenticated now: the 401 has no session to recover
        let err = client.request(ApiRequest::get("/api/events")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.calls_with_bearer(None), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expiry_spares_a_newer_login() {
        let store = t1_session();
        let relogin = store.clone();
        // Every bearer is refused; a login lands while the replay is in flight
        let transport = Arc::new(ScriptedTransport::new(move |request| {
            if request.path == REFRESH_PATH {
                return Ok(ApiResponse::new(200, REFRESHED));
            }
            if request.bearer() == Some("T2") {
                let relogin = relogin.clone();
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(relogin.set(TokenPair::new(
                        AccessToken::new("T9"),
                        RefreshToken::new("R9"),
                    )))
                })
                .unwrap();
            }
            Ok(ApiResponse::new(401, r#"{"message":"jwt expired"}"#))
        }));
        let client = client(transport.clone(), store.clone());

        let err = client.request(ApiRequest::get("/api/meals")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(store.access_token().await.unwrap().as_str(), "T9");
    }

    #[tokio::test]
    async fn non_auth_failures_surface_without_refresh() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            let status = match request.path.as_str() {
                "/api/wallet" => 503,
                "/api/admin" => 403,
                _ => 404,
            };
            Ok(transport::ApiResponse::new(status, r#"{"message":"nope"}"#))
        }));
        let client = client(transport.clone(), t1_session());

        let err = client.request(ApiRequest::get("/api/wallet")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.status, Some(503));
        assert_eq!(err.message, "nope");

        let err = client.request(ApiRequest::get("/api/admin")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.status, Some(403));

        assert_eq!(transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn transport_failures_are_network_errors() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Err(TransportError::Connect("connection refused".into()))
        }));
        let client = client(transport.clone(), t1_session());

        let err = client.request(ApiRequest::get("/api/events")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
        assert!(err.status.is_none());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn caller_authorization_is_replaced() {
        let transport = Arc::new(ScriptedTransport::campus("T1", 200, REFRESHED));
        let client = client(transport.clone(), t1_session());

        let mut request = ApiRequest::get("/api/attendance");
        request
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        client.request(request).await.unwrap();

        assert_eq!(transport.calls_with_bearer(Some("T1")), 1);
        assert_eq!(transport.calls_with_bearer(Some("forged")), 0);
    }

    #[tokio::test]
    async fn login_and_logout_drive_store_and_events() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            let response = if request.path == LOGIN_PATH {
                ApiResponse::new(200, r#"{"accessToken":"T9","refreshToken":"R9"}"#)
            } else {
                ApiResponse::new(200, "{}")
            };
            Ok(response)
        }));
        let store = Arc::new(TokenStore::in_memory());
        let client = client(transport.clone(), store.clone());
        let mut events = client.subscribe();

        assert!(!client.status().await.logged_in);
        client
            .login(&serde_json::json!({"studentId": "s1024", "password": "hunter2"}))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedIn);
        assert_eq!(store.get().await.unwrap().refresh.as_str(), "R9");

        let status = client.status().await;
        assert!(status.logged_in);
        assert_eq!(status.access_expires_at, None);
        assert!(!status.refreshing);

        let login_body: serde_json::Value =
            serde_json::from_slice(transport.requests()[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(login_body["studentId"], "s1024");

        client.logout().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        assert!(!client.status().await.logged_in);
    }

    #[tokio::test]
    async fn failed_login_leaves_session_untouched() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(ApiResponse::new(401, r#"{"message":"invalid student id or password"}"#))
        }));
        let store = t1_session();
        let client = client(transport.clone(), store.clone());

        let err = client.login(&serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.message, "invalid student id or password");
        assert_eq!(store.access_token().await.unwrap().as_str(), "T1");
        assert_eq!(transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_does_not_wedge_the_coordinator() {
        let (transport, gate) = ScriptedTransport::campus("T2", 200, REFRESHED).gated();
        let transport = Arc::new(transport);
        let client = client(transport.clone(), t1_session());

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.request(ApiRequest::get("/api/meals")).await })
        };
        wait_until(|| transport.refresh_calls() == 1).await;
        first.abort();
        gate.add_permits(1);

        while client.coordinator().state().await != RefreshState::Idle {
            tokio::task::yield_now().await;
        }
        let response = client.request(ApiRequest::get("/api/events")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn end_to_end_over_http() {
        use transport::HttpTransport;
        use wiremock::matchers::{body_json, header as header_is, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/meals"))
            .and(header_is("authorization", "Bearer T1"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"message": "jwt expired"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .and(body_json(serde_json::json!({"refreshToken": "R1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "T2", "refreshToken": "R2"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/meals"))
            .and(header_is("authorization", "Bearer T2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"lunch": "ramen"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let store = Arc::new(TokenStore::load(token_path.clone()).await.unwrap());
        store
            .set(TokenPair::new(AccessToken::new("T1"), RefreshToken::new("R1")))
            .await
            .unwrap();

        let http = HttpTransport::new(reqwest::Client::new(), server.uri(), Duration::from_secs(5));
        let client = AuthClient::new(Arc::new(http), store, SessionSettings::default());

        let response = client.request(ApiRequest::get("/api/meals")).await.unwrap();
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["lunch"], "ramen");

        let reloaded = TokenStore::load(token_path).await.unwrap();
        let pair = reloaded.get().await.unwrap();
        assert_eq!(pair.access.as_str(), "T2");
        assert_eq!(pair.refresh.as_str(), "R2");
    }
}
