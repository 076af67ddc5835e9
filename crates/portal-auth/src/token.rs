//! Token endpoint exchanges
//!
//! Handles the two token endpoint interactions:
//! 1. Login (credentials → fresh pair)
//! 2. Refresh (refresh token → new access token, maybe a rotated refresh token)
//!
//! Both go through the `Transport` like every other request, but never carry
//! a bearer header. These functions only perform the exchange; persisting
//! the result and single-flighting concurrent refreshes is the caller's job.

use serde::Deserialize;
use tracing::debug;
use transport::{ApiRequest, Transport};

use crate::constants::{LOGIN_PATH, REFRESH_PATH};
use crate::error::{Error, Result};
use crate::pair::{AccessToken, RefreshToken, TokenPair};

/// Paths of the token endpoints, relative to the transport base URL.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub refresh_path: String,
    pub login_path: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            refresh_path: REFRESH_PATH.to_string(),
            login_path: LOGIN_PATH.to_string(),
        }
    }
}

/// Wire shape shared by the login and refresh responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Result of a successful refresh. `refresh` is `None` when the server kept
/// the existing refresh token.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access: AccessToken,
    pub refresh: Option<RefreshToken>,
}

/// Exchange the refresh token for a new access token.
///
/// Any non-2xx status is `Rejected`; a body that is not JSON or lacks a
/// non-empty `accessToken` is `Validation`.
pub async fn refresh_access_token(
    transport: &dyn Transport,
    endpoints: &AuthEndpoints,
    refresh: &RefreshToken,
) -> Result<RefreshedTokens> {
    let request = ApiRequest::post(endpoints.refresh_path.as_str())
        .json(&serde_json::json!({ "refreshToken": refresh.as_str() }))
        .map_err(|e| Error::Validation(e.message))?;

    let body = exchange(transport, request, "refresh").await?;
    let access = require_token(body.access_token, "accessToken")?;
    let refresh = body
        .refresh_token
        .filter(|t| !t.is_empty())
        .map(RefreshToken::new);

    debug!(rotated = refresh.is_some(), "refresh exchange succeeded");
    Ok(RefreshedTokens {
        access: AccessToken::new(access),
        refresh,
    })
}

/// Exchange user credentials for a token pair.
///
/// `credentials` is forwarded verbatim; its shape is the campus API's concern.
pub async fn login(
    transport: &dyn Transport,
    endpoints: &AuthEndpoints,
    credentials: &serde_json::Value,
) -> Result<TokenPair> {
    let request = ApiRequest::post(endpoints.login_path.as_str())
        .json(credentials)
        .map_err(|e| Error::Validation(e.message))?;

    let body = exchange(transport, request, "login").await?;
    let access = require_token(body.access_token, "accessToken")?;
    let refresh = require_token(body.refresh_token, "refreshToken")?;

    debug!("login exchange succeeded");
    Ok(TokenPair::new(
        AccessToken::new(access),
        RefreshToken::new(refresh),
    ))
}

async fn exchange(
    transport: &dyn Transport,
    request: ApiRequest,
    what: &str,
) -> Result<TokenResponse> {
    let response = transport
        .send(request)
        .await
        .map_err(|e| Error::Http(format!("{what} request failed: {e}")))?;

    if !response.is_success() {
        return Err(Error::Rejected {
            status: response.status,
            body: response.text(),
        });
    }

    response
        .json::<TokenResponse>()
        .map_err(|e| Error::Validation(format!("malformed {what} response: {e}")))
}

fn require_token(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Validation(format!("response is missing {field}"))),
    }
}
