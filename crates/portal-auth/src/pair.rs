//! Access/refresh token types
//!
//! Both tokens are opaque to the client. The only thing ever read out of an
//! access token is the optional JWT `exp` claim, used to refresh proactively
//! before the server starts answering 401.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Short-lived bearer credential attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.expose()
    }

    /// Expiry from the JWT payload's `exp` claim, as unix seconds.
    ///
    /// Returns `None` for tokens that are not three-segment JWTs or whose
    /// payload carries no numeric `exp`.
    pub fn expires_at(&self) -> Option<u64> {
        let mut segments = self.as_str().split('.');
        let (_header, payload, _signature) =
            (segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        let exp = claims.get("exp")?;
        exp.as_u64().or_else(|| exp.as_f64().map(|f| f as u64))
    }

    /// Whether the encoded expiry falls within `window` of now.
    /// Tokens without an encoded expiry never count as expiring.
    pub fn expires_within(&self, window: Duration) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        match self.expires_at() {
            Some(exp) => exp <= now.saturating_add(window.as_secs()),
            None => false,
        }
    }
}

/// Longer-lived credential exchanged for new access tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken(Secret<String>);

impl RefreshToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.expose()
    }
}

/// The unit of persistence. An access token only ever exists alongside the
/// refresh token that can renew it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

impl TokenPair {
    pub fn new(access: AccessToken, refresh: RefreshToken) -> Self {
        Self { access, refresh }
    }

    /// Pair after a refresh: the access token is always replaced, the refresh
    /// token only when the server issued a new one.
    pub fn rotate(&self, access: AccessToken, refresh: Option<RefreshToken>) -> Self {
        Self {
            access,
            refresh: refresh.unwrap_or_else(|| self.refresh.clone()),
        }
    }
}
