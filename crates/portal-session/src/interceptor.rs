//! Request and response interceptors
//!
//! `authorize` runs before every send; `inspect` runs on every response and
//! decides whether to deliver it, fail, recover the session, or end it.
//! Neither touches the token store or the coordinator itself.

use portal_auth::AccessToken;
use tracing::warn;
use transport::{ApiError, ApiRequest, ApiResponse, HeaderValue, header};

use crate::classify;

/// Replace any caller-supplied Authorization with the session's bearer token.
///
/// With no token the request goes out unauthenticated and the server decides.
pub fn authorize(request: &mut ApiRequest, token: Option<&AccessToken>) {
    request.headers.remove(header::AUTHORIZATION);

    let Some(token) = token else {
        return;
    };
    match HeaderValue::from_str(&format!("Bearer {}", token.as_str())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, value);
        }
        Err(e) => {
            warn!(error = %e, "access token is not a valid header value, sending unauthenticated");
        }
    }
}

/// What to do with a response.
#[derive(Debug)]
pub enum Disposition {
    /// 2xx, hand back unchanged
    Deliver(ApiResponse),
    /// First 401 for this request: recover the session and replay once
    Recover,
    /// Surface to the caller
    Reject(ApiError),
    /// 401 on the replay: the refreshed token was refused too, end the session
    Expire(ApiError),
}

/// Decide the fate of a response. `retried` is the request's retry flag: set
/// once the request has already been replayed after a recovery.
pub fn inspect(response: ApiResponse, retried: bool) -> Disposition {
    if response.is_success() {
        return Disposition::Deliver(response);
    }

    if !classify::is_authorization_failure(response.status) {
        return Disposition::Reject(classify::classify_response(&response));
    }

    if retried {
        let mut error = classify::classify_response(&response);
        error.message = format!("request rejected after token refresh: {}", error.message);
        Disposition::Expire(error)
    } else {
        Disposition::Recover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::ErrorKind;

    #[test]
    fn attaches_bearer_when_token_present() {
        let mut request = ApiRequest::get("/api/meals");
        authorize(&mut request, Some(&AccessToken::new("T1")));
        assert_eq!(
            request.headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer T1"
        );
        assert!(request.headers.get(header::AUTHORIZATION).unwrap().is_sensitive());
    }

    #[test]
    fn leaves_request_unauthenticated_without_token() {
        let mut request = ApiRequest::get("/api/meals");
        authorize(&mut request, None);
        assert!(request.headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn caller_authorization_is_replaced_or_removed() {
        let mut request = ApiRequest::get("/api/meals");
        request
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        authorize(&mut request, Some(&AccessToken::new("T2")));
        assert_eq!(request.bearer(), Some("T2"));

        authorize(&mut request, None);
        assert!(request.bearer().is_none());
    }

    #[test]
    fn invalid_token_is_skipped() {
        let mut request = ApiRequest::get("/api/meals");
        authorize(&mut request, Some(&AccessToken::new("T1\nInjected: yes")));
        assert!(request.headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn success_is_delivered_unchanged() {
        match inspect(ApiResponse::new(200, "ok"), false) {
            Disposition::Deliver(r) => assert_eq!(r.text(), "ok"),
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn first_401_asks_for_recovery() {
        assert!(matches!(
            inspect(ApiResponse::new(401, ""), false),
            Disposition::Recover
        ));
    }

    #[test]
    fn retried_401_expires_the_session() {
        match inspect(ApiResponse::new(401, r#"{"message":"jwt expired"}"#), true) {
            Disposition::Expire(err) => {
                assert_eq!(err.kind, ErrorKind::AuthExpired);
                assert_eq!(err.status, Some(401));
                assert!(err.message.contains("jwt expired"));
            }
            other => panic!("expected Expire, got {other:?}"),
        }
    }

    #[test]
    fn retried_non_auth_failure_is_plain_reject() {
        assert!(matches!(
            inspect(ApiResponse::new(503, ""), true),
            Disposition::Reject(_)
        ));
    }

    #[test]
    fn other_failures_never_recover() {
        for status in [400, 403, 404, 429, 500, 503] {
            match inspect(ApiResponse::new(status, ""), false) {
                Disposition::Reject(err) => {
                    assert_eq!(err.kind, ErrorKind::ServerError);
                    assert_eq!(err.status, Some(status));
                }
                other => panic!("status {status}: expected Reject, got {other:?}"),
            }
        }
    }
}
