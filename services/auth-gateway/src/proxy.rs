//! HTTP proxy to the application back-end
//!
//! Receives every request not handled by the gateway itself, strips
//! hop-by-hop headers and any client-supplied `x-auth-*` identity headers,
//! injects the signed-in identity and the configured static headers, and
//! forwards to the upstream URL. Upstream responses (including error statuses)
//! are returned verbatim.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tracing::{error, instrument, warn};

use crate::config::HeaderInjection;
use crate::error::error_response;
use crate::metrics;
use crate::session::Session;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Identity headers owned by the gateway. Anything with this prefix coming
/// from the client is dropped.
const AUTH_HEADER_PREFIX: &str = "x-auth-";
const USER_ID_HEADER: &str = "x-auth-user-id";
const USER_EMAIL_HEADER: &str = "x-auth-user-email";
const PROVIDER_HEADER: &str = "x-auth-provider";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Process-wide counters reported by `/health`.
#[derive(Debug, Clone)]
pub struct ServiceCounters {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being proxied, reported when the drain times out.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceCounters {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceCounters {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared state for proxying
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub headers_to_inject: Vec<HeaderInjection>,
    pub timeout: Duration,
    pub counters: ServiceCounters,
}

/// Proxy an inbound request upstream, attaching `identity` when the caller
/// has a live session.
///
/// Upstream timeouts get 2 retries with 100ms fixed backoff.
#[instrument(
    skip_all,
    fields(request_id = %request_id, method = %request.method(), path = %request.uri().path())
)]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    identity: Option<&Session>,
    request_id: String,
) -> Response {
    let _in_flight = InFlightGuard::enter(&state.counters.in_flight);
    let started = Instant::now();
    state.counters.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let response = forward(state, request, identity, &request_id).await;

    if response.status().is_server_error() {
        state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    identity: Option<&Session>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let upstream_url = match uri.path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_auth_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // Static injections replace client values with the same name
    for injection in &state.headers_to_inject {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        let value = match HeaderValue::from_str(&injection.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        headers.insert(name, value);
    }

    if let Some(session) = identity {
        for (name, value) in [
            (USER_ID_HEADER, session.provider_user_id.as_str()),
            (USER_EMAIL_HEADER, session.email.as_str()),
            (PROVIDER_HEADER, session.provider.as_str()),
        ] {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.insert(HeaderName::from_static(name), v);
                }
                Err(e) => warn!(header = name, error = %e, "identity value is not a valid header"),
            }
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    // Up to 2 retries (3 total attempts) for timeouts only
    let max_attempts = 3u32;
    let retry_delay = Duration::from_millis(100);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(retry_delay).await;
        }

        let req = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone());

        match req.send().await {
            Ok(upstream_response) => {
                let status = upstream_response.status();
                let resp_headers = upstream_response.headers().clone();

                return match upstream_response.bytes().await {
                    Ok(resp_body) => {
                        let mut response = Response::builder().status(status);
                        for (name, value) in &resp_headers {
                            if !is_hop_by_hop(name.as_str()) {
                                response = response.header(name, value);
                            }
                        }
                        response
                            .body(axum::body::Body::from(resp_body))
                            .unwrap_or_else(|e| {
                                error_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    "proxy_error",
                                    &format!("response build error: {e}"),
                                    request_id,
                                )
                            })
                    }
                    Err(e) => {
                        metrics::record_upstream_error("body");
                        error!(error = %e, "failed to read upstream response body");
                        error_response(
                            StatusCode::BAD_GATEWAY,
                            "proxy_error",
                            "upstream response could not be read",
                            request_id,
                        )
                    }
                };
            }
            Err(e) if e.is_timeout() && attempt < max_attempts - 1 => continue,
            Err(e) if e.is_timeout() => {
                metrics::record_upstream_error("timeout");
                error!(error = %e, attempts = max_attempts, "upstream timeout after all retries");
                return error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "proxy_error",
                    &format!(
                        "upstream timeout after {}s ({max_attempts} attempts)",
                        state.timeout.as_secs()
                    ),
                    request_id,
                );
            }
            Err(e) => {
                metrics::record_upstream_error("connection");
                error!(error = %e, "upstream request failed");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "proxy_error",
                    "upstream unavailable",
                    request_id,
                );
            }
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "proxy_error",
        "unexpected retry exhaustion",
        request_id,
    )
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Gateway-owned identity header.
pub fn is_auth_header(name: &str) -> bool {
    name.len() >= AUTH_HEADER_PREFIX.len()
        && name[..AUTH_HEADER_PREFIX.len()].eq_ignore_ascii_case(AUTH_HEADER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn auth_header_detection() {
        assert!(is_auth_header("x-auth-user-id"));
        assert!(is_auth_header("X-Auth-Anything"));
        assert!(!is_auth_header("x-authority"));
        assert!(!is_auth_header("x-au"));
        assert!(!is_auth_header("authorization"));
    }

    #[test]
    fn in_flight_guard_balances() {
        let counters = ServiceCounters::new();
        {
            let _a = InFlightGuard::enter(&counters.in_flight);
            let _b = InFlightGuard::enter(&counters.in_flight);
            assert_eq!(counters.in_flight.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counters.in_flight.load(Ordering::Relaxed), 0);
    }
}
