//! Request-path error taxonomy
//!
//! Every failure of the sign-in flow maps to one `AuthError` variant, and
//! every variant maps to a fixed status code and a JSON body:
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//!
//! Messages shown to the browser are deliberately generic for upstream
//! failures; the detail goes to the log under the same request id.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use identity::ProfileMappingError;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid code verifier: {0}")]
    InvalidVerifierFormat(String),

    #[error("no pending sign-in for this state (expired, replayed or never started)")]
    MissingVerifier,

    #[error("state validation failed: {0}")]
    InvalidState(String),

    #[error("malformed callback: {0}")]
    InvalidCallback(String),

    #[error("token exchange failed: {message}")]
    OAuthExchange { message: String, timeout: bool },

    #[error("rate limit exceeded ({limit} per window)")]
    RateLimitExceeded { retry_after: Duration, limit: u32 },

    #[error("profile mapping failed: {0}")]
    ProfileMapping(#[from] ProfileMappingError),

    #[error("provider denied the request: {error}")]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not signed in")]
    Unauthenticated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidVerifierFormat(_)
            | AuthError::MissingVerifier
            | AuthError::InvalidState(_)
            | AuthError::InvalidCallback(_) => StatusCode::BAD_REQUEST,
            AuthError::OAuthExchange { .. } | AuthError::ProfileMapping(_) => {
                StatusCode::BAD_GATEWAY
            }
            AuthError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::ProviderDenied { .. } | AuthError::Unauthenticated => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable `type` field of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidVerifierFormat(_) => "invalid_verifier_format",
            AuthError::MissingVerifier => "missing_verifier",
            AuthError::InvalidState(_) => "invalid_state",
            AuthError::InvalidCallback(_) => "invalid_callback",
            AuthError::OAuthExchange { .. } => "oauth_exchange",
            AuthError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AuthError::ProfileMapping(_) => "profile_mapping",
            AuthError::ProviderDenied { .. } => "provider_denied",
            AuthError::UnknownProvider(_) => "unknown_provider",
            AuthError::StoreUnavailable(_) => "store_unavailable",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Text safe to show the browser.
    fn public_message(&self) -> String {
        match self {
            AuthError::OAuthExchange { .. } | AuthError::StoreUnavailable(_) => {
                "sign-in temporarily unavailable".into()
            }
            AuthError::ProfileMapping(_) => {
                "the identity provider returned an incomplete profile".into()
            }
            AuthError::ProviderDenied { error, description } => match description {
                Some(desc) => format!("sign-in was not completed: {error} ({desc})"),
                None => format!("sign-in was not completed: {error}"),
            },
            AuthError::Internal(_) => "internal error".into(),
            other => other.to_string(),
        }
    }

    /// Render the error with an explicit request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(request_id, kind = self.kind(), error = %self, "request failed");
        } else {
            warn!(request_id, kind = self.kind(), error = %self, "request rejected");
        }

        let mut response = error_response(status, self.kind(), &self.public_message(), request_id);
        if let AuthError::RateLimitExceeded { retry_after, .. } = &self {
            let secs = retry_after_secs(*retry_after);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let request_id = new_request_id();
        self.into_response_with_id(&request_id)
    }
}

impl From<pkce::Error> for AuthError {
    fn from(e: pkce::Error) -> Self {
        match e {
            pkce::Error::InvalidVerifierFormat(msg) => AuthError::InvalidVerifierFormat(msg),
            pkce::Error::StoreUnavailable(msg) => AuthError::StoreUnavailable(msg),
            pkce::Error::AuthorizationUrl(msg) => AuthError::Internal(msg),
        }
    }
}

impl From<identity::Error> for AuthError {
    fn from(e: identity::Error) -> Self {
        match e {
            identity::Error::Timeout(message) => AuthError::OAuthExchange {
                message,
                timeout: true,
            },
            identity::Error::Http(message)
            | identity::Error::TokenExchange(message)
            | identity::Error::Userinfo(message) => AuthError::OAuthExchange {
                message,
                timeout: false,
            },
            identity::Error::ProfileMapping(e) => AuthError::ProfileMapping(e),
            identity::Error::Config(msg)
            | identity::Error::UserParse(msg)
            | identity::Error::Io(msg) => AuthError::Internal(msg),
        }
    }
}

impl From<rate_limit::Error> for AuthError {
    /// A broken counter store fails closed.
    fn from(e: rate_limit::Error) -> Self {
        AuthError::StoreUnavailable(e.to_string())
    }
}

/// Whole seconds to wait, rounded up and never 0.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// JSON error body shared by the auth routes and the proxy.
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        let cases = [
            (AuthError::InvalidVerifierFormat("x".into()), 400),
            (AuthError::MissingVerifier, 400),
            (AuthError::InvalidState("x".into()), 400),
            (
                AuthError::OAuthExchange {
                    message: "x".into(),
                    timeout: true,
                },
                502,
            ),
            (
                AuthError::RateLimitExceeded {
                    retry_after: Duration::from_secs(1),
                    limit: 5,
                },
                429,
            ),
            (
                AuthError::ProfileMapping(ProfileMappingError::MissingField("email")),
                502,
            ),
            (
                AuthError::ProviderDenied {
                    error: "access_denied".into(),
                    description: None,
                },
                401,
            ),
            (AuthError::UnknownProvider("x".into()), 404),
            (AuthError::StoreUnavailable("x".into()), 503),
            (AuthError::Unauthenticated, 401),
            (AuthError::Internal("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
        }
    }

    #[tokio::test]
    async fn exchange_failure_hides_detail() {
        let err = AuthError::OAuthExchange {
            message: "token endpoint returned 400: invalid_client secret=abc".into(),
            timeout: false,
        };
        let response = err.into_response_with_id("req_test");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "oauth_exchange");
        assert_eq!(json["error"]["message"], "sign-in temporarily unavailable");
        assert_eq!(json["error"]["request_id"], "req_test");
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after_rounded_up() {
        let err = AuthError::RateLimitExceeded {
            retry_after: Duration::from_millis(12_300),
            limit: 5,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "13");

        let json = body_json(response).await;
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[test]
    fn retry_after_is_never_zero() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
    }

    #[test]
    fn library_errors_map_into_taxonomy() {
        let e: AuthError = identity::Error::Timeout("slow".into()).into();
        assert!(matches!(e, AuthError::OAuthExchange { timeout: true, .. }));

        let e: AuthError = pkce::Error::StoreUnavailable("full".into()).into();
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);

        let e: AuthError = pkce::Error::InvalidVerifierFormat("short".into()).into();
        assert_eq!(e.kind(), "invalid_verifier_format");

        let e: AuthError =
            identity::Error::ProfileMapping(ProfileMappingError::MissingField("sub")).into();
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
    }
}
