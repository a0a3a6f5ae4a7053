//! Identity provider adapters
//!
//! Defines the `IdentityProvider` trait that decouples the callback handler
//! from provider specifics. Each adapter (Azure AD, Google, Authentik) owns
//! its endpoints, default scopes and payload mapping; only a
//! `CanonicalProfile` crosses the adapter boundary, so adding a provider
//! never touches the callback handler.
//!
//! Adapters are selected by configuration (`kind`), never by inspecting a
//! payload at runtime.

pub mod authentik;
pub mod azure;
pub mod error;
pub mod google;
pub mod profile;
pub mod token;
pub mod users;

pub use authentik::AuthentikProvider;
pub use azure::AzureAdProvider;
pub use error::{Error, Result};
pub use google::GoogleProvider;
pub use profile::{CanonicalProfile, ProfileMappingError};
pub use token::{HttpProviderClient, ProviderClient, TokenRequest, TokenResponse};
pub use users::{UserRecord, UserStore};

use std::path::PathBuf;
use std::sync::Arc;

use common::Secret;
use pkce::ChallengeMethod;
use serde::Deserialize;
use serde_json::Value;

/// Supported identity provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    AzureAd,
    Google,
    Authentik,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AzureAd => "azure_ad",
            ProviderKind::Google => "google",
            ProviderKind::Authentik => "authentik",
        }
    }
}

fn default_true() -> bool {
    true
}

/// One `[[providers]]` entry from the gateway configuration.
///
/// The client secret is never read from the TOML itself; it is resolved from
/// `client_secret_env` or `client_secret_file` by the config loader.
#[derive(Debug, Deserialize)]
pub struct ProviderSpec {
    /// Route segment and lookup key (`/auth/{name}/login`).
    pub name: String,
    pub kind: ProviderKind,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Azure AD directory (tenant) id or `common`/`organizations`.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Authentik instance base URL, e.g. `https://sso.example.org`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Overrides the adapter's default scopes when non-empty.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub challenge_method: ChallengeMethod,
    /// Must stay true; a provider without PKCE is refused.
    #[serde(default = "default_true")]
    pub pkce: bool,
    /// Must stay true; a provider without `state` is refused.
    #[serde(default = "default_true")]
    pub state: bool,
    /// Optional `prompt` parameter (e.g. `select_account`).
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub scopes: Vec<String>,
    pub challenge_method: ChallengeMethod,
    pub extra_params: Vec<(String, String)>,
}

impl ProviderSettings {
    fn from_spec(spec: &ProviderSpec, default_scopes: &[&str]) -> Self {
        let scopes = if spec.scopes.is_empty() {
            default_scopes.iter().map(|s| s.to_string()).collect()
        } else {
            spec.scopes.clone()
        };
        let extra_params = spec
            .prompt
            .iter()
            .map(|p| ("prompt".to_string(), p.clone()))
            .collect();
        Self {
            name: spec.name.clone(),
            client_id: spec.client_id.clone(),
            client_secret: spec.client_secret.clone(),
            scopes,
            challenge_method: spec.challenge_method,
            extra_params,
        }
    }
}

/// Provider-specific endpoints and payload mapping.
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn settings(&self) -> &ProviderSettings;

    fn authorization_endpoint(&self) -> &str;

    fn token_endpoint(&self) -> &str;

    /// Endpoint queried with the access token for profile claims. `None`
    /// means the profile comes from the ID token alone.
    fn userinfo_endpoint(&self) -> Option<&str>;

    fn name(&self) -> &str {
        &self.settings().name
    }

    fn scopes(&self) -> &[String] {
        &self.settings().scopes
    }

    fn extra_authorization_params(&self) -> &[(String, String)] {
        &self.settings().extra_params
    }

    /// Assemble the raw provider payload from the token response and the
    /// userinfo document (when one was fetched).
    fn profile_payload(
        &self,
        tokens: &TokenResponse,
        userinfo: Option<Value>,
    ) -> std::result::Result<Value, ProfileMappingError> {
        match userinfo {
            Some(info) => Ok(info),
            None => tokens.id_token_claims(),
        }
    }

    /// Normalize a provider payload into the canonical profile.
    fn map_profile(
        &self,
        payload: &Value,
    ) -> std::result::Result<CanonicalProfile, ProfileMappingError>;
}

/// Build the adapter for a configured provider.
///
/// Rejects, at configuration time, any provider that would run without PKCE
/// or without a `state` parameter, and providers missing the fields their
/// kind requires.
pub fn build_provider(spec: &ProviderSpec) -> Result<Arc<dyn IdentityProvider>> {
    if spec.name.trim().is_empty() {
        return Err(Error::Config("provider name must not be empty".into()));
    }
    if !spec
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Config(format!(
            "provider name {:?} must only contain [A-Za-z0-9_-]",
            spec.name
        )));
    }
    if spec.client_id.trim().is_empty() {
        return Err(Error::Config(format!(
            "provider {}: client_id must not be empty",
            spec.name
        )));
    }
    if !spec.pkce {
        return Err(Error::Config(format!(
            "provider {}: PKCE cannot be disabled",
            spec.name
        )));
    }
    if !spec.state {
        return Err(Error::Config(format!(
            "provider {}: the state parameter cannot be disabled",
            spec.name
        )));
    }

    let provider: Arc<dyn IdentityProvider> = match spec.kind {
        ProviderKind::AzureAd => Arc::new(AzureAdProvider::from_spec(spec)?),
        ProviderKind::Google => Arc::new(GoogleProvider::from_spec(spec)),
        ProviderKind::Authentik => Arc::new(AuthentikProvider::from_spec(spec)?),
    };
    Ok(provider)
}
