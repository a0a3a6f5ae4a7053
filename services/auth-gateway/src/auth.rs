//! Sign-in routes
//!
//! Endpoints:
//! - GET  /auth/providers - configured providers
//! - GET  /auth/{provider}/login - start PKCE flow, 302 to the provider
//! - GET  /auth/{provider}/callback - verify state, exchange code, open session
//! - GET  /auth/session - current session, or 401
//! - POST /auth/refresh - rotate the session id and extend it
//! - POST /auth/logout - end the session
//!
//! Login, callback and refresh are counted against their rate limit class
//! before any other work.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, FromRef, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use rate_limit::{Decision, EndpointClass, RateLimiter, client_ip};
use tracing::info;

use crate::error::{AuthError, new_request_id};
use crate::flow::{AuthFlow, CallbackParams};
use crate::metrics;
use crate::session::{SESSION_COOKIE, SessionView};

/// Carries the sign-in `state` from initiation to callback.
pub const STATE_COOKIE: &str = "bak_oauth_state";
const STATE_COOKIE_PATH: &str = "/auth";

/// Shared state for the sign-in routes.
#[derive(Clone)]
pub struct AuthState {
    pub flow: Arc<AuthFlow>,
    pub limiter: Arc<RateLimiter>,
    pub trusted_proxies: Arc<[IpAddr]>,
    pub cookie_secure: bool,
    /// Where the browser lands after a successful sign-in.
    pub post_login_url: String,
}

impl AuthState {
    /// Count one request against `class`.
    pub async fn enforce(
        &self,
        class: EndpointClass,
        peer: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<(), AuthError> {
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let client = client_ip(peer.ip(), forwarded_for, &self.trusted_proxies);

        match self.limiter.check(class, client).await? {
            Decision::Allowed { .. } => Ok(()),
            Decision::Throttled { retry_after, limit } => {
                metrics::record_throttled(class);
                Err(AuthError::RateLimitExceeded { retry_after, limit })
            }
        }
    }

    /// Count a sign-in outcome. Only configured provider names become
    /// labels; any other path segment is not recorded.
    fn record_flow(&self, provider: &str, outcome: &str) {
        if let Ok(p) = self.flow.provider(provider) {
            metrics::record_auth_flow(p.name(), outcome);
        }
    }

    fn state_cookie(&self, state: String) -> Cookie<'static> {
        Cookie::build((STATE_COOKIE, state))
            .path(STATE_COOKIE_PATH)
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.cookie_secure)
            .build()
    }

    fn session_cookie(&self, id: String) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, id))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.cookie_secure)
            .build()
    }
}

/// Build the sign-in router for any outer state that can hand out an
/// `AuthState`.
pub fn auth_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    AuthState: FromRef<S>,
{
    Router::new()
        .route("/auth/providers", get(list_providers))
        .route("/auth/session", get(current_session))
        .route("/auth/refresh", post(refresh_session))
        .route("/auth/logout", post(logout))
        .route("/auth/{provider}/login", get(login))
        .route("/auth/{provider}/callback", get(callback))
}

/// GET /auth/providers: names and kinds, never client ids or secrets.
async fn list_providers(State(state): State<AuthState>) -> impl IntoResponse {
    let providers: Vec<_> = state
        .flow
        .providers()
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name(),
                "kind": p.kind().as_str(),
                "login_url": format!("/auth/{}/login", p.name()),
            })
        })
        .collect();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "providers": providers }).to_string(),
    )
}

/// GET /auth/{provider}/login: 302 to the provider's consent page.
async fn login(
    State(state): State<AuthState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let request_id = new_request_id();

    let result = match state
        .enforce(EndpointClass::OauthInitiate, peer, &headers)
        .await
    {
        Ok(()) => state.flow.initiate(&provider).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(initiation) => {
            state.record_flow(&provider, "initiated");
            let jar = jar.add(state.state_cookie(initiation.state));
            (
                StatusCode::FOUND,
                jar,
                [(header::LOCATION, initiation.authorization_url.to_string())],
            )
                .into_response()
        }
        Err(e) => {
            state.record_flow(&provider, e.kind());
            e.into_response_with_id(&request_id)
        }
    }
}

/// GET /auth/{provider}/callback: provider redirect target.
///
/// Whatever the outcome once the flow has been looked at, the state cookie is
/// cleared: a callback is never retried with the same `state`.
async fn callback(
    State(state): State<AuthState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let request_id = new_request_id();

    if let Err(e) = state
        .enforce(EndpointClass::OauthCallback, peer, &headers)
        .await
    {
        return e.into_response_with_id(&request_id);
    }

    let cookie_state = jar.get(STATE_COOKIE).map(|c| c.value().to_string());
    let result = state
        .flow
        .complete(&provider, cookie_state.as_deref(), params)
        .await;
    let jar = jar.remove(Cookie::build(STATE_COOKIE).path(STATE_COOKIE_PATH));

    match result {
        Ok(sign_in) => {
            state.record_flow(&provider, "success");
            let jar = jar.add(state.session_cookie(sign_in.session.id));
            (
                StatusCode::FOUND,
                jar,
                [(header::LOCATION, state.post_login_url.clone())],
            )
                .into_response()
        }
        Err(e) => {
            state.record_flow(&provider, e.kind());
            (jar, e.into_response_with_id(&request_id)).into_response()
        }
    }
}

/// GET /auth/session: who is signed in.
async fn current_session(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|c| state.flow.sessions().get(c.value()));

    match session {
        Some(session) => (
            StatusCode::OK,
            axum::Json(SessionView::new(&session)),
        )
            .into_response(),
        None => AuthError::Unauthenticated.into_response(),
    }
}

/// POST /auth/refresh: new session id, fresh expiry.
async fn refresh_session(
    State(state): State<AuthState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let request_id = new_request_id();

    if let Err(e) = state
        .enforce(EndpointClass::TokenRefresh, peer, &headers)
        .await
    {
        return e.into_response_with_id(&request_id);
    }

    let rotated = jar
        .get(SESSION_COOKIE)
        .and_then(|c| state.flow.sessions().rotate(c.value()));

    match rotated {
        Some(session) => {
            let view = SessionView::new(&session);
            let jar = jar.add(state.session_cookie(session.id));
            (StatusCode::OK, jar, axum::Json(view)).into_response()
        }
        None => AuthError::Unauthenticated.into_response_with_id(&request_id),
    }
}

/// POST /auth/logout: always succeeds, signed in or not.
async fn logout(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let ended = jar
        .get(SESSION_COOKIE)
        .is_some_and(|c| state.flow.sessions().remove(c.value()));
    if ended {
        info!("session ended");
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (StatusCode::NO_CONTENT, jar).into_response()
}
