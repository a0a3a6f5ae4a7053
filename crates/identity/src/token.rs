//! Token endpoint exchange and userinfo retrieval
//!
//! Handles the two server-to-server calls of the callback:
//! 1. Authorization code exchange (`grant_type=authorization_code` with the
//!    PKCE `code_verifier`)
//! 2. Userinfo lookup with the fresh access token, for providers whose
//!    profile is not fully carried by the ID token
//!
//! Both calls are bounded by the client's timeout; a timeout surfaces as
//! `Error::Timeout` rather than hanging the request.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pkce::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::profile::ProfileMappingError;

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenResponse {
    /// Decode the claims of the ID token.
    ///
    /// The token was received directly from the provider's token endpoint
    /// over TLS, so its signature is not re-verified here (OIDC Core
    /// §3.1.3.7).
    pub fn id_token_claims(&self) -> std::result::Result<Value, ProfileMappingError> {
        let id_token = self
            .id_token
            .as_deref()
            .ok_or(ProfileMappingError::MissingField("id_token"))?;
        decode_jwt_claims(id_token)
    }
}

/// Decode the payload segment of a compact JWT.
pub fn decode_jwt_claims(jwt: &str) -> std::result::Result<Value, ProfileMappingError> {
    let mut segments = jwt.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => {
            return Err(ProfileMappingError::InvalidPayload(
                "id_token is not a compact JWT".into(),
            ));
        }
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ProfileMappingError::InvalidPayload(format!("id_token payload: {e}")))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ProfileMappingError::InvalidPayload(format!("id_token claims: {e}")))?;
    if !claims.is_object() {
        return Err(ProfileMappingError::InvalidPayload(
            "id_token claims are not an object".into(),
        ));
    }
    Ok(claims)
}

/// Parameters of an authorization-code exchange.
pub struct TokenRequest<'a> {
    pub token_endpoint: &'a str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub client_id: &'a str,
    pub code_verifier: &'a str,
    /// Only for confidential clients; PKCE makes it optional.
    pub client_secret: Option<&'a str>,
}

impl TokenRequest<'_> {
    fn form(&self) -> Vec<(&str, &str)> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", self.code),
            ("redirect_uri", self.redirect_uri),
            ("client_id", self.client_id),
            ("code_verifier", self.code_verifier),
        ];
        if let Some(secret) = self.client_secret {
            form.push(("client_secret", secret));
        }
        form
    }
}

/// OAuth error body (RFC 6749 §5.2).
#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Network side of the callback: exchange and userinfo calls.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProviderClient>`), which also lets tests observe whether the
/// token endpoint was reached.
pub trait ProviderClient: Send + Sync {
    fn exchange_code<'a>(&'a self, request: TokenRequest<'a>)
    -> BoxFuture<'a, Result<TokenResponse>>;

    fn fetch_userinfo<'a>(
        &'a self,
        endpoint: &'a str,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// `reqwest`-backed provider client with a per-call timeout.
#[derive(Clone)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

fn send_error(context: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{context}: {e}"))
    } else {
        Error::Http(format!("{context}: {e}"))
    }
}

impl ProviderClient for HttpProviderClient {
    fn exchange_code<'a>(
        &'a self,
        request: TokenRequest<'a>,
    ) -> BoxFuture<'a, Result<TokenResponse>> {
        Box::pin(async move {
            let response = self
                .client
                .post(request.token_endpoint)
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&request.form())
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| send_error("token exchange request failed", e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                let message = match serde_json::from_str::<OAuthErrorBody>(&body) {
                    Ok(err) => match err.error_description {
                        Some(desc) => format!("{}: {desc}", err.error),
                        None => err.error,
                    },
                    Err(_) => body,
                };
                return Err(Error::TokenExchange(format!(
                    "token endpoint returned {status}: {message}"
                )));
            }

            let tokens = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::Timeout(format!("reading token response: {e}"))
                    } else {
                        Error::TokenExchange(format!("invalid token response: {e}"))
                    }
                })?;
            debug!(
                has_id_token = tokens.id_token.is_some(),
                has_refresh_token = tokens.refresh_token.is_some(),
                "token exchange succeeded"
            );
            Ok(tokens)
        })
    }

    fn fetch_userinfo<'a>(
        &'a self,
        endpoint: &'a str,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let response = self
                .client
                .get(endpoint)
                .bearer_auth(access_token)
                .header(reqwest::header::ACCEPT, "application/json")
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| send_error("userinfo request failed", e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Userinfo(format!("userinfo endpoint returned {status}")));
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| Error::Userinfo(format!("invalid userinfo response: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Form;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Start a mock provider: `/token` echoes the posted form back inside the
    /// ID token claims, `/userinfo` requires the bearer token.
    async fn start_mock_provider() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/token",
                    post(|Form(form): Form<HashMap<String, String>>| async move {
                        if form.get("code").map(String::as_str) == Some("bad-code") {
                            return (
                                StatusCode::BAD_REQUEST,
                                r#"{"error":"invalid_grant","error_description":"code expired"}"#
                                    .to_string(),
                            );
                        }
                        let claims = serde_json::to_vec(&form).unwrap();
                        let id_token = format!("e30.{}.sig", URL_SAFE_NO_PAD.encode(claims));
                        (
                            StatusCode::OK,
                            serde_json::json!({
                                "access_token": "at_123",
                                "token_type": "Bearer",
                                "expires_in": 3600,
                                "id_token": id_token,
                            })
                            .to_string(),
                        )
                    }),
                )
                .route(
                    "/userinfo",
                    get(|headers: HeaderMap| async move {
                        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                            Some("Bearer at_123") => (
                                StatusCode::OK,
                                r#"{"sub":"u1","email":"a@b.c"}"#.to_string(),
                            ),
                            _ => (StatusCode::UNAUTHORIZED, String::new()),
                        }
                    }),
                )
                .route(
                    "/slow",
                    post(|| async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        "late"
                    }),
                );
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    fn client(timeout: Duration) -> HttpProviderClient {
        HttpProviderClient::new(reqwest::Client::new(), timeout)
    }

    #[tokio::test]
    async fn exchange_posts_pkce_form() {
        let (url, _server) = start_mock_provider().await;
        let endpoint = format!("{url}/token");

        let tokens = client(Duration::from_secs(5))
            .exchange_code(TokenRequest {
                token_endpoint: &endpoint,
                code: "auth-code",
                redirect_uri: "https://boite.example/auth/azure/callback",
                client_id: "client-123",
                code_verifier: "verifier-abc",
                client_secret: None,
            })
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at_123");
        assert_eq!(tokens.expires_in, Some(3600));

        let form = tokens.id_token_claims().unwrap();
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "auth-code");
        assert_eq!(form["code_verifier"], "verifier-abc");
        assert_eq!(form["client_id"], "client-123");
        assert_eq!(
            form["redirect_uri"],
            "https://boite.example/auth/azure/callback"
        );
        assert!(
            form.get("client_secret").is_none(),
            "public clients must not send a client_secret"
        );
    }

    #[tokio::test]
    async fn exchange_includes_secret_for_confidential_clients() {
        let (url, _server) = start_mock_provider().await;
        let endpoint = format!("{url}/token");

        let tokens = client(Duration::from_secs(5))
            .exchange_code(TokenRequest {
                token_endpoint: &endpoint,
                code: "auth-code",
                redirect_uri: "https://boite.example/cb",
                client_id: "client-123",
                code_verifier: "verifier-abc",
                client_secret: Some("s3cret"),
            })
            .await
            .unwrap();
        assert_eq!(tokens.id_token_claims().unwrap()["client_secret"], "s3cret");
    }

    #[tokio::test]
    async fn rejected_code_reports_oauth_error() {
        let (url, _server) = start_mock_provider().await;
        let endpoint = format!("{url}/token");

        let err = client(Duration::from_secs(5))
            .exchange_code(TokenRequest {
                token_endpoint: &endpoint,
                code: "bad-code",
                redirect_uri: "https://boite.example/cb",
                client_id: "client-123",
                code_verifier: "verifier-abc",
                client_secret: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TokenExchange(_)));
        let message = err.to_string();
        assert!(message.contains("invalid_grant"), "got: {message}");
        assert!(message.contains("code expired"), "got: {message}");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn slow_token_endpoint_times_out() {
        let (url, _server) = start_mock_provider().await;
        let endpoint = format!("{url}/slow");

        let err = client(Duration::from_millis(50))
            .exchange_code(TokenRequest {
                token_endpoint: &endpoint,
                code: "auth-code",
                redirect_uri: "https://boite.example/cb",
                client_id: "client-123",
                code_verifier: "verifier-abc",
                client_secret: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got: {err}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_http_error() {
        let err = client(Duration::from_secs(5))
            .exchange_code(TokenRequest {
                token_endpoint: "http://127.0.0.1:1/token",
                code: "c",
                redirect_uri: "https://boite.example/cb",
                client_id: "client-123",
                code_verifier: "v",
                client_secret: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err}");
    }

    #[tokio::test]
    async fn userinfo_uses_bearer_token() {
        let (url, _server) = start_mock_provider().await;
        let endpoint = format!("{url}/userinfo");
        let c = client(Duration::from_secs(5));

        let info = c.fetch_userinfo(&endpoint, "at_123").await.unwrap();
        assert_eq!(info["sub"], "u1");

        let err = c.fetch_userinfo(&endpoint, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Userinfo(_)));
    }

    #[test]
    fn token_response_deserializes_minimal_body() {
        let json = r#"{"access_token":"at_abc"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert!(token.refresh_token.is_none());
        assert!(token.id_token.is_none());
    }

    #[test]
    fn token_response_debug_redacts_tokens() {
        let token = TokenResponse {
            access_token: "at_secret".into(),
            token_type: Some("Bearer".into()),
            expires_in: Some(60),
            refresh_token: Some("rt_secret".into()),
            id_token: None,
            scope: None,
        };
        let debug = format!("{token:?}");
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }

    #[test]
    fn jwt_claims_decode() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"oid":"abc","tid":"t1"}"#);
        let claims = decode_jwt_claims(&format!("h.{payload}.s")).unwrap();
        assert_eq!(claims["oid"], "abc");

        assert!(decode_jwt_claims("only-one-segment").is_err());
        assert!(decode_jwt_claims("h.!!!.s").is_err());
        let array = URL_SAFE_NO_PAD.encode(b"[1,2]");
        assert!(decode_jwt_claims(&format!("h.{array}.s")).is_err());
    }

    #[test]
    fn missing_id_token_is_a_mapping_error() {
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(
            token.id_token_claims().unwrap_err(),
            ProfileMappingError::MissingField("id_token")
        );
    }
}
