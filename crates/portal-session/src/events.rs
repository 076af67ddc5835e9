//! Session lifecycle notifications
//!
//! Broadcast so any number of collaborators (UI layer, status endpoints) can
//! react to the session ending without polling the store. Lagging receivers
//! lose old events, never block the request path.

use tokio::sync::broadcast;

/// Buffered events per receiver before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login stored a fresh token pair
    LoggedIn,
    /// A refresh replaced the access token
    Refreshed,
    /// The refresh failed or its token was refused; tokens cleared, re-authentication required
    Expired { reason: String },
    /// The tokens were cleared on request
    LoggedOut,
}

impl SessionEvent {
    pub fn label(&self) -> &'static str {
        match self {
            SessionEvent::LoggedIn => "logged_in",
            SessionEvent::Refreshed => "refreshed",
            SessionEvent::Expired { .. } => "expired",
            SessionEvent::LoggedOut => "logged_out",
        }
    }
}

pub(crate) fn channel() -> broadcast::Sender<SessionEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Send to whoever is listening. Having no subscribers is normal.
pub(crate) fn emit(events: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let _ = events.send(event);
}
