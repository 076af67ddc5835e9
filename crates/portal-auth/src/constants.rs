//! Campus API token endpoint defaults
//!
//! Both paths are relative to the upstream base URL and can be overridden in
//! the proxy's `[session]` config section.

/// Exchanges a refresh token for a new access token
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchanges user credentials for a fresh token pair
pub const LOGIN_PATH: &str = "/auth/login";

/// Default upper bound on a single refresh exchange, in seconds.
/// A refresh that has not settled by then counts as failed so queued
/// requests are never stranded.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;
