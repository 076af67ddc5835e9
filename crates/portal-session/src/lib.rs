//! Authenticated transport for the campus portal
//!
//! Wraps a `Transport` with bearer-token injection and transparent recovery
//! from expired access tokens. Many requests can fail with 401 at once; the
//! `RefreshCoordinator` makes sure exactly one refresh exchange runs and the
//! rest wait for its outcome, then each request is replayed at most once.
//!
//! Request lifecycle (`AuthClient::request`):
//! 1. `interceptor::authorize` stamps the stored access token
//! 2. `Transport::send` issues the call
//! 3. `interceptor::inspect` delivers 2xx, rejects non-auth failures via
//!    `classify`, or asks for recovery on a first 401
//! 4. `RefreshCoordinator::recover` refreshes (single-flight) or queues
//! 5. The request is replayed once with the new token
//!
//! A failed refresh clears the token store and surfaces `AUTH_EXPIRED`; no
//! further refresh is attempted until `AuthClient::login` stores a new pair.

pub mod classify;
pub mod client;
pub mod coordinator;
pub mod events;
pub mod interceptor;
pub mod refresh;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify_response, classify_status, is_authorization_failure};
pub use client::{AuthClient, SessionSettings, SessionStatus};
pub use coordinator::{PendingWaiter, RefreshCoordinator, RefreshState};
pub use events::SessionEvent;
pub use interceptor::{Disposition, authorize, inspect};
pub use refresh::spawn_refresh_task;
