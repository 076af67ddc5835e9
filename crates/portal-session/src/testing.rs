//! Scripted transport for state machine tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use portal_auth::REFRESH_PATH;
use tokio::sync::Semaphore;
use transport::{ApiRequest, ApiResponse, Transport, TransportError};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

/// Answers from a closure, records every request, and can hold refresh
/// responses until the test releases them.
pub(crate) struct ScriptedTransport {
    handler: Handler,
    seen: Mutex<Vec<ApiRequest>>,
    refresh_gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            seen: Mutex::new(vec![]),
            refresh_gate: None,
        }
    }

    /// A campus API where only `valid` is accepted and the refresh endpoint
    /// answers with `refresh_status` / `refresh_body`.
    pub(crate) fn campus(valid: &'static str, refresh_status: u16, refresh_body: &'static str) -> Self {
        Self::new(move |request| {
            if request.path == REFRESH_PATH {
                return Ok(ApiResponse::new(refresh_status, refresh_body));
            }
            if request.bearer() == Some(valid) {
                Ok(ApiResponse::new(
                    200,
                    serde_json::json!({ "path": request.path }).to_string(),
                ))
            } else {
                Ok(ApiResponse::new(401, r#"{"message":"jwt expired"}"#))
            }
        })
    }

    /// Hold every refresh response until a permit is added to the returned gate.
    pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.refresh_gate = Some(gate.clone());
        (self, gate)
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path == REFRESH_PATH)
            .count()
    }

    /// Non-refresh requests that carried the given bearer (`None` = no header).
    pub(crate) fn calls_with_bearer(&self, bearer: Option<&str>) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path != REFRESH_PATH && r.bearer() == bearer)
            .count()
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + '_>> {
        self.seen.lock().unwrap().push(request.clone());
        let gate = if request.path == REFRESH_PATH {
            self.refresh_gate.clone()
        } else {
            None
        };
        Box::pin(async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            (self.handler)(&request)
        })
    }
}

/// Yield to other tasks until `condition` holds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
