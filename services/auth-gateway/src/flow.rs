//! Sign-in orchestration: initiation and callback
//!
//! Initiation:
//! 1. Generate verifier, challenge and `state`
//! 2. Save the pending flow under `state` (no redirect if this fails)
//! 3. Hand back the provider's authorization URL
//!
//! Callback, in this order:
//! 1. Provider-reported `error` ends the attempt; its pending flow is cleared
//! 2. Query `state` must equal the state cookie, otherwise nothing is
//!    exchanged and the cookie's pending flow is cleared
//! 3. The pending flow is taken (read + delete in one step), so a replayed
//!    or concurrent duplicate callback finds nothing
//! 4. Code exchange with the verifier, at most one retry on timeout
//! 5. Profile fetched, mapped by the adapter, user upserted, session opened

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use identity::{
    IdentityProvider, ProviderClient, TokenRequest, TokenResponse, UserRecord, UserStore,
};
use pkce::{
    AuthorizationRequest, PendingFlow, PkceParams, StorageScope, VerifierStore,
    build_authorization_url, generate_state,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::AuthError;
use crate::session::{ProviderTokens, Session, SessionStore};

const EXCHANGE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Query string of `GET /auth/{provider}/callback`.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of a successful initiation.
#[derive(Debug)]
pub struct Initiation {
    pub authorization_url: Url,
    pub state: String,
}

/// Result of a successful callback.
#[derive(Debug)]
pub struct SignIn {
    pub user: UserRecord,
    pub session: Session,
}

pub struct FlowSettings {
    /// External base URL used to build redirect URIs.
    pub public_url: String,
    pub retry_on_timeout: bool,
    pub retain_provider_tokens: bool,
}

pub struct AuthFlow {
    providers: Vec<Arc<dyn IdentityProvider>>,
    by_name: HashMap<String, usize>,
    verifiers: Arc<dyn VerifierStore>,
    client: Arc<dyn ProviderClient>,
    users: Arc<UserStore>,
    sessions: Arc<SessionStore>,
    settings: FlowSettings,
}

impl AuthFlow {
    pub fn new(
        providers: Vec<Arc<dyn IdentityProvider>>,
        verifiers: Arc<dyn VerifierStore>,
        client: Arc<dyn ProviderClient>,
        users: Arc<UserStore>,
        sessions: Arc<SessionStore>,
        settings: FlowSettings,
    ) -> Self {
        let by_name = providers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), i))
            .collect();
        Self {
            providers,
            by_name,
            verifiers,
            client,
            users,
            sessions,
            settings,
        }
    }

    pub fn providers(&self) -> &[Arc<dyn IdentityProvider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Result<&Arc<dyn IdentityProvider>, AuthError> {
        self.by_name
            .get(name)
            .map(|&i| &self.providers[i])
            .ok_or_else(|| AuthError::UnknownProvider(name.to_string()))
    }

    pub fn verifiers(&self) -> &Arc<dyn VerifierStore> {
        &self.verifiers
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn redirect_uri(&self, provider: &str) -> String {
        format!(
            "{}/auth/{provider}/callback",
            self.settings.public_url.trim_end_matches('/')
        )
    }

    /// Start a sign-in with `provider_name`.
    pub async fn initiate(&self, provider_name: &str) -> Result<Initiation, AuthError> {
        let provider = self.provider(provider_name)?;
        let settings = provider.settings();

        let pkce = PkceParams::generate(settings.challenge_method);
        let state = generate_state();
        let redirect_uri = self.redirect_uri(provider.name());

        let authorization_url = build_authorization_url(
            &AuthorizationRequest {
                endpoint: provider.authorization_endpoint(),
                client_id: &settings.client_id,
                redirect_uri: &redirect_uri,
                scopes: provider.scopes(),
                extra_params: provider.extra_authorization_params(),
            },
            &pkce,
            &state,
        )?;

        let flow = PendingFlow::new(provider.name(), pkce.code_verifier, pkce.method);
        self.verifiers
            .store(&state, flow, StorageScope::Session)
            .await?;

        debug!(provider = provider.name(), method = %pkce.method, "sign-in initiated");
        Ok(Initiation {
            authorization_url,
            state,
        })
    }

    /// Finish a sign-in from the provider's redirect.
    ///
    /// `cookie_state` is the value of the state cookie set at initiation.
    pub async fn complete(
        &self,
        provider_name: &str,
        cookie_state: Option<&str>,
        params: CallbackParams,
    ) -> Result<SignIn, AuthError> {
        let provider = self.provider(provider_name)?;

        if let Some(error) = params.error {
            for state in [params.state.as_deref(), cookie_state].into_iter().flatten() {
                self.discard(state).await;
            }
            return Err(AuthError::ProviderDenied {
                error,
                description: params.error_description,
            });
        }

        let Some(query_state) = params.state.as_deref() else {
            if let Some(state) = cookie_state {
                self.discard(state).await;
            }
            return Err(AuthError::InvalidState("callback carries no state".into()));
        };
        let Some(cookie_state) = cookie_state else {
            self.discard(query_state).await;
            return Err(AuthError::InvalidState(
                "no sign-in in progress in this browser".into(),
            ));
        };
        if !constant_time_eq(query_state.as_bytes(), cookie_state.as_bytes()) {
            self.discard(cookie_state).await;
            return Err(AuthError::InvalidState(
                "state does not match this browser's sign-in".into(),
            ));
        }

        let flow = self
            .verifiers
            .take(query_state, StorageScope::Session)
            .await?
            .ok_or(AuthError::MissingVerifier)?;

        if flow.provider != provider.name() {
            return Err(AuthError::InvalidState(format!(
                "sign-in was started with {}, not {}",
                flow.provider,
                provider.name()
            )));
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::InvalidCallback("missing authorization code".into()))?;

        // The verifier never left the server, but check it before it goes
        // on the wire.
        let pkce = PkceParams::from_verifier(flow.verifier.expose(), flow.method)?;

        let tokens = self
            .exchange(provider.as_ref(), &code, &pkce.code_verifier)
            .await?;

        let userinfo = match provider.userinfo_endpoint() {
            Some(endpoint) => Some(
                self.client
                    .fetch_userinfo(endpoint, &tokens.access_token)
                    .await?,
            ),
            None => None,
        };
        let payload = provider.profile_payload(&tokens, userinfo)?;
        let profile = provider.map_profile(&payload)?;

        let user = self.users.upsert(provider.name(), profile).await?;

        let retained = self
            .settings
            .retain_provider_tokens
            .then(|| ProviderTokens::from(tokens));
        let session = self.sessions.create(&user, retained);

        info!(
            provider = provider.name(),
            user = %user.key(),
            "sign-in completed"
        );
        Ok(SignIn { user, session })
    }

    async fn exchange(
        &self,
        provider: &dyn IdentityProvider,
        code: &str,
        verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let redirect_uri = self.redirect_uri(provider.name());
        let settings = provider.settings();
        let max_attempts = if self.settings.retry_on_timeout { 2 } else { 1 };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = TokenRequest {
                token_endpoint: provider.token_endpoint(),
                code,
                redirect_uri: &redirect_uri,
                client_id: &settings.client_id,
                code_verifier: verifier,
                client_secret: settings.client_secret.as_ref().map(|s| s.expose().as_str()),
            };
            match self.client.exchange_code(request).await {
                Ok(tokens) => return Ok(tokens),
                Err(e) if e.is_timeout() && attempt < max_attempts => {
                    warn!(
                        provider = provider.name(),
                        attempt,
                        "token exchange timed out, retrying"
                    );
                    tokio::time::sleep(EXCHANGE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn discard(&self, state: &str) {
        if let Err(e) = self.verifiers.clear(state, StorageScope::Session).await {
            warn!(error = %e, "failed to clear pending sign-in");
        }
    }
}

/// Byte comparison whose duration does not depend on where the inputs differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use identity::{ProviderKind, ProviderSpec};
    use pkce::{BoxFuture, ChallengeMethod, InMemoryVerifierStore};
    use serde_json::Value;

    /// Scripted provider client that records what reached the token endpoint.
    pub struct SpyClient {
        pub exchanges: AtomicUsize,
        pub timeouts_before_success: AtomicUsize,
        pub last_verifier: Mutex<Option<String>>,
        pub userinfo: Value,
        pub id_token: Option<String>,
    }

    impl SpyClient {
        pub fn new(userinfo: Value) -> Self {
            Self {
                exchanges: AtomicUsize::new(0),
                timeouts_before_success: AtomicUsize::new(0),
                last_verifier: Mutex::new(None),
                userinfo,
                id_token: None,
            }
        }

        pub fn exchange_count(&self) -> usize {
            self.exchanges.load(Ordering::SeqCst)
        }
    }

    impl ProviderClient for SpyClient {
        fn exchange_code<'a>(
            &'a self,
            request: TokenRequest<'a>,
        ) -> BoxFuture<'a, identity::Result<TokenResponse>> {
            Box::pin(async move {
                self.exchanges.fetch_add(1, Ordering::SeqCst);
                *self.last_verifier.lock().unwrap() = Some(request.code_verifier.to_string());
                let pending = self.timeouts_before_success.load(Ordering::SeqCst);
                if pending > 0 {
                    self.timeouts_before_success.store(pending - 1, Ordering::SeqCst);
                    return Err(identity::Error::Timeout("spy timeout".into()));
                }
                Ok(TokenResponse {
                    access_token: "at_spy".into(),
                    token_type: Some("Bearer".into()),
                    expires_in: Some(3600),
                    refresh_token: Some("rt_spy".into()),
                    id_token: self.id_token.clone(),
                    scope: None,
                })
            })
        }

        fn fetch_userinfo<'a>(
            &'a self,
            _endpoint: &'a str,
            _access_token: &'a str,
        ) -> BoxFuture<'a, identity::Result<Value>> {
            Box::pin(async move { Ok(self.userinfo.clone()) })
        }
    }

    pub fn provider_spec(name: &str, kind: ProviderKind) -> ProviderSpec {
        ProviderSpec {
            name: name.into(),
            kind,
            client_id: "client-123".into(),
            client_secret: None,
            client_secret_env: None,
            client_secret_file: None,
            tenant_id: Some("tenant-1".into()),
            base_url: Some("https://sso.example.org".into()),
            scopes: vec![],
            challenge_method: ChallengeMethod::S256,
            pkce: true,
            state: true,
            prompt: None,
        }
    }

    pub fn google_userinfo() -> Value {
        serde_json::json!({
            "sub": "110169484474386276334",
            "email": "Paul.Martin@gmail.com",
            "email_verified": true,
            "name": "Paul Martin"
        })
    }

    pub async fn test_flow(
        dir: &tempfile::TempDir,
        client: Arc<SpyClient>,
        retry_on_timeout: bool,
    ) -> AuthFlow {
        let providers = vec![
            identity::build_provider(&provider_spec("google", ProviderKind::Google)).unwrap(),
            identity::build_provider(&provider_spec("sso", ProviderKind::Authentik)).unwrap(),
        ];
        let users = UserStore::load(dir.path().join("users.json")).await.unwrap();
        AuthFlow::new(
            providers,
            Arc::new(InMemoryVerifierStore::new(Duration::from_secs(600), 100)),
            client,
            Arc::new(users),
            Arc::new(SessionStore::new(Duration::from_secs(3600))),
            FlowSettings {
                public_url: "https://boite.example/".into(),
                retry_on_timeout,
                retain_provider_tokens: false,
            },
        )
    }
}
