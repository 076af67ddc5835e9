//! Proactive background token refresh
//!
//! Refreshes an access token whose encoded expiry is close, so most requests
//! never see a 401 at all. The refresh goes through the same coordinator as
//! the request path: if a 401-triggered refresh is already running, the
//! background task simply waits for it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::AuthClient;

/// Spawn a background task that refreshes the access token once it expires
/// within `threshold`. Checks every `interval`.
///
/// Opaque tokens (no `exp` claim) are left to the 401 path.
pub fn spawn_refresh_task(
    client: Arc<AuthClient>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&client, threshold).await;
        }
    })
}

async fn refresh_cycle(client: &AuthClient, threshold: Duration) {
    let Some(token) = client.token_store().access_token().await else {
        return;
    };
    if !token.expires_within(threshold) {
        return;
    }

    debug!(expires_at = ?token.expires_at(), "access token expiring within threshold, refreshing");
    match client.coordinator().recover(Some(&token)).await {
        Ok(_) => info!("background token refresh completed"),
        Err(e) => warn!(error = %e, "background token refresh failed"),
    }
}
