//! Single-flight token refresh
//!
//! The coordinator owns the only mutable refresh state in the session: whether
//! a refresh is in flight, and the FIFO queue of callers waiting on it. Both
//! sit behind one async mutex, so deciding "start a refresh" versus "wait for
//! the running one" is atomic no matter how the runtime schedules tasks.
//!
//! State machine:
//! - `Idle` + rejected request → `Refreshing`, one refresh exchange spawned
//! - `Refreshing` + rejected request → queued, no extra exchange
//! - `Refreshing` + exchange succeeds → store updated, waiters get the token, `Idle`
//! - `Refreshing` + exchange fails or times out → store cleared, waiters get
//!   `AUTH_EXPIRED`, `Idle`
//!
//! The exchange runs on its own task. A refresher whose caller goes away
//! still settles every waiter.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use portal_auth::{AccessToken, AuthEndpoints, TokenPair, TokenStore};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};
use transport::{ApiError, Transport};

use crate::classify;
use crate::events::{self, SessionEvent};

/// What a waiter receives when the refresh settles.
pub type Resolution = Result<AccessToken, ApiError>;

/// A caller suspended until the in-flight refresh settles.
pub struct PendingWaiter {
    resolve: Box<dyn FnOnce(Resolution) + Send>,
}

impl PendingWaiter {
    pub fn new(resolve: impl FnOnce(Resolution) + Send + 'static) -> Self {
        Self {
            resolve: Box::new(resolve),
        }
    }

    /// Waiter backed by a oneshot channel. A dropped receiver is ignored.
    pub fn channel() -> (Self, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Self::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (waiter, rx)
    }

    fn settle(self, outcome: Resolution) {
        (self.resolve)(outcome)
    }
}

impl fmt::Debug for PendingWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWaiter").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

impl RefreshState {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
        }
    }
}

struct Slot {
    state: RefreshState,
    waiters: VecDeque<PendingWaiter>,
}

/// Decision taken under the slot lock, acted on after releasing it.
enum Admission {
    Queued,
    Settled(PendingWaiter, Resolution),
    Refresh(TokenPair),
}

struct Inner {
    slot: Mutex<Slot>,
    store: Arc<TokenStore>,
    transport: Arc<dyn Transport>,
    endpoints: AuthEndpoints,
    timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

/// Handle to the shared refresh state. Clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<TokenStore>,
        endpoints: AuthEndpoints,
        timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: RefreshState::Idle,
                    waiters: VecDeque::new(),
                }),
                store,
                transport,
                endpoints,
                timeout,
                events,
            }),
        }
    }

    pub async fn state(&self) -> RefreshState {
        self.inner.slot.lock().await.state
    }

    /// Callers currently waiting on the in-flight refresh (the refresher included).
    pub async fn pending(&self) -> usize {
        self.inner.slot.lock().await.waiters.len()
    }

    /// Obtain a usable access token after a request sent with `stale` was
    /// rejected. Refreshes at most once across all concurrent callers.
    ///
    /// Fails with `AUTH_EXPIRED` when there is no session or the refresh fails.
    pub async fn recover(&self, stale: Option<&AccessToken>) -> Resolution {
        let (waiter, rx) = PendingWaiter::channel();
        self.submit(waiter, stale).await;
        rx.await
            .unwrap_or_else(|_| Err(ApiError::auth_expired("token refresh was abandoned")))
    }

    /// Hand a waiter to the state machine. Returns once it is queued or
    /// already resolved; the waiter itself is resolved exactly once.
    pub async fn submit(&self, waiter: PendingWaiter, stale: Option<&AccessToken>) {
        match self.admit(waiter, stale).await {
            Admission::Queued => {}
            Admission::Settled(waiter, outcome) => waiter.settle(outcome),
            Admission::Refresh(pair) => {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.run_refresh(pair).await });
            }
        }
    }

    async fn admit(&self, waiter: PendingWaiter, stale: Option<&AccessToken>) -> Admission {
        let mut slot = self.inner.slot.lock().await;

        if slot.state == RefreshState::Refreshing {
            slot.waiters.push_back(waiter);
            metrics::counter!("portal_refresh_waiters_total").increment(1);
            debug!(waiters = slot.waiters.len(), "queued behind in-flight refresh");
            return Admission::Queued;
        }

        let Some(pair) = self.inner.store.get().await else {
            debug!("no session to recover, refresh skipped");
            return Admission::Settled(
                waiter,
                Err(ApiError::auth_expired("no active session, log in again")),
            );
        };

        if stale != Some(&pair.access) {
            debug!("access token already replaced, refresh skipped");
            return Admission::Settled(waiter, Ok(pair.access));
        }

        slot.state = RefreshState::Refreshing;
        slot.waiters.push_back(waiter);
        Admission::Refresh(pair)
    }
}

impl Inner {
    async fn run_refresh(&self, pair: TokenPair) {
        info!("access token rejected, refreshing");

        let exchange = portal_auth::refresh_access_token(
            self.transport.as_ref(),
            &self.endpoints,
            &pair.refresh,
        );
        let exchanged = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(refreshed)) => {
                record_outcome("success");
                info!(rotated = refreshed.refresh.is_some(), "token refresh succeeded");
                Ok(pair.rotate(refreshed.access, refreshed.refresh))
            }
            Ok(Err(e)) => {
                record_outcome("failure");
                warn!(error = %e, "token refresh failed, clearing session");
                Err(classify::refresh_failure(&e))
            }
            Err(_) => {
                record_outcome("timeout");
                warn!(timeout_secs = self.timeout.as_secs(), "token refresh timed out, clearing session");
                Err(ApiError::auth_expired(format!(
                    "session expired: token refresh timed out after {:?}",
                    self.timeout
                )))
            }
        };

        // A login or logout that landed mid-refresh wins over this outcome
        let replacement = exchanged.as_ref().ok().cloned();
        let (outcome, event) = match self.store.replace_if(&pair.access, replacement).await {
            Ok(false) => {
                info!("session replaced during refresh, handing out the current token");
                let current = self.store.access_token().await.ok_or_else(|| {
                    ApiError::auth_expired("session ended during token refresh")
                });
                (current, None)
            }
            stored => {
                if let Err(e) = stored {
                    warn!(error = %e, "failed to persist token update, keeping it in memory");
                }
                let event = match &exchanged {
                    Ok(_) => SessionEvent::Refreshed,
                    Err(e) => SessionEvent::Expired {
                        reason: e.message.clone(),
                    },
                };
                (exchanged.map(|next| next.access), Some(event))
            }
        };

        self.settle(outcome, event).await;
    }

    /// Return to `Idle` and resolve every waiter in arrival order.
    async fn settle(&self, outcome: Resolution, event: Option<SessionEvent>) {
        let waiters = {
            let mut slot = self.slot.lock().await;
            slot.state = RefreshState::Idle;
            std::mem::take(&mut slot.waiters)
        };

        if let Some(event) = event {
            events::emit(&self.events, event);
        }

        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "resolving refresh waiters");
        for waiter in waiters {
            waiter.settle(outcome.clone());
        }
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("portal_token_refresh_total", "outcome" => outcome).increment(1);
}
