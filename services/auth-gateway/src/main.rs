//! Boîte à Kiffs authentication gateway
//!
//! Single-binary Rust service that:
//! 1. Signs users in with Azure AD, Google or Authentik (OAuth 2.0 + PKCE)
//! 2. Keeps server-side sessions behind an HttpOnly cookie
//! 3. Rate-limits authentication endpoints per client address
//! 4. Proxies everything else to the application back-end with the
//!    signed-in identity attached

mod auth;
mod config;
mod error;
mod flow;
mod metrics;
mod proxy;
mod session;
mod sweeper;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{ConnectInfo, FromRef, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum_extra::extract::CookieJar;
use identity::{HttpProviderClient, UserStore};
use pkce::InMemoryVerifierStore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::AuthState;
use crate::config::{Config, PathRules};
use crate::error::new_request_id;
use crate::flow::{AuthFlow, FlowSettings};
use crate::proxy::{ProxyState, ServiceCounters};
use crate::session::{SESSION_COOKIE, SessionStore};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    auth: AuthState,
    proxy: ProxyState,
    path_rules: Arc<PathRules>,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(auth::auth_routes::<AppState>())
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting boite-auth-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        public_url = %config.server.public_url,
        upstream_url = %config.proxy.upstream_url,
        providers = config.providers.len(),
        headers = config.headers.len(),
        "configuration loaded"
    );

    let providers = config
        .providers
        .iter()
        .map(identity::build_provider)
        .collect::<identity::Result<Vec<_>>>()
        .context("failed to build identity providers")?;
    if providers.is_empty() {
        warn!("no identity providers configured, sign-in is disabled");
    }

    let http_client = reqwest::Client::new();
    let provider_client = Arc::new(HttpProviderClient::new(
        http_client.clone(),
        Duration::from_secs(config.oauth.exchange_timeout_secs),
    ));

    let users = UserStore::load(config.session.users_file.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load users from {}",
                config.session.users_file.display()
            )
        })?;

    let verifiers = Arc::new(InMemoryVerifierStore::new(
        Duration::from_secs(config.oauth.flow_ttl_secs),
        config.oauth.max_pending_flows,
    ));
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(
        config.session.ttl_secs,
    )));
    let limiter = Arc::new(config.rate_limiter());

    let flow = AuthFlow::new(
        providers,
        verifiers.clone(),
        provider_client,
        Arc::new(users),
        sessions.clone(),
        FlowSettings {
            public_url: config.server.public_url.clone(),
            retry_on_timeout: config.oauth.retry_on_timeout,
            retain_provider_tokens: config.session.retain_provider_tokens,
        },
    );

    let _sweeper = sweeper::spawn_sweep_task(
        limiter.clone(),
        verifiers,
        sessions,
        Duration::from_secs(config.server.sweep_interval_secs),
    );

    let counters = ServiceCounters::new();

    let app_state = AppState {
        auth: AuthState {
            flow: Arc::new(flow),
            limiter,
            trusted_proxies: config.rate_limit.trusted_proxies.clone().into(),
            cookie_secure: config.server.cookie_secure,
            post_login_url: format!("{}/", config.server.public_url.trim_end_matches('/')),
        },
        proxy: ProxyState {
            client: http_client,
            upstream_url: config.proxy.upstream_url.clone(),
            headers_to_inject: config.headers.clone(),
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            counters: counters.clone(),
        },
        path_rules: Arc::new(config.rate_limit.paths),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = counters.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: the server is told to drain, then the drain is raced
    // against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, uptime, traffic counters and store sizes.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counters = &state.proxy.counters;
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": counters.started_at.elapsed().as_secs(),
        "requests_served": counters.requests_total.load(Ordering::Relaxed),
        "errors_total": counters.errors_total.load(Ordering::Relaxed),
        "providers": state.auth.flow.providers().len(),
        "pending_flows": state.auth.flow.verifiers().len().await,
        "active_sessions": state.auth.flow.sessions().len(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies everything else to the back-end.
///
/// `POST`s to a configured authentication path are counted against its rate
/// limit class first.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = new_request_id();

    let class = if request.method() == Method::POST {
        state.path_rules.classify(request.uri().path())
    } else {
        None
    };
    if let Some(class) = class {
        let limited = state.auth.enforce(class, peer, request.headers()).await;
        if let Err(e) = limited {
            return e.into_response_with_id(&request_id);
        }
    }

    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|c| state.auth.flow.sessions().get(c.value()));
    proxy::proxy_request(&state.proxy, request, session.as_ref(), request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
