//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Provider client secrets are loaded from the env var named by
//! `client_secret_env` or from `client_secret_file`, never stored in the TOML
//! directly to avoid leaking secrets.

use std::borrow::Cow;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use identity::{ProviderKind, ProviderSpec};
use pkce::ChallengeMethod;
use rate_limit::{EndpointClass, Policy, RateLimiter};
use serde::Deserialize;
use tracing::warn;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

/// Listener and public-facing settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// External base URL; callbacks are `{public_url}/auth/{provider}/callback`.
    pub public_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Adds `Secure` to every cookie. Only disable for plain-HTTP development.
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
}

/// Application back-end settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Header to inject into proxied requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// Keep the provider's access/refresh tokens in the session.
    #[serde(default)]
    pub retain_provider_tokens: bool,
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            retain_provider_tokens: false,
            users_file: default_users_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_flow_ttl")]
    pub flow_ttl_secs: u64,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    #[serde(default = "default_max_pending_flows")]
    pub max_pending_flows: usize,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            flow_ttl_secs: default_flow_ttl(),
            exchange_timeout_secs: default_exchange_timeout(),
            retry_on_timeout: true,
            max_pending_flows: default_max_pending_flows(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RateLimitConfig {
    /// Addresses that are never counted.
    #[serde(default)]
    pub allowlist: Vec<IpAddr>,
    /// Peers whose `X-Forwarded-For` is believed.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    #[serde(default)]
    pub policies: PolicyOverrides,
    #[serde(default)]
    pub paths: PathRules,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolicyConfig {
    pub limit: u32,
    pub window_secs: u64,
}

/// Optional per-class replacements for the built-in budgets.
#[derive(Debug, Default, Deserialize)]
pub struct PolicyOverrides {
    pub login: Option<PolicyConfig>,
    pub oauth_initiate: Option<PolicyConfig>,
    pub oauth_callback: Option<PolicyConfig>,
    pub token_refresh: Option<PolicyConfig>,
    pub registration: Option<PolicyConfig>,
    pub password_reset: Option<PolicyConfig>,
}

impl PolicyOverrides {
    fn iter(&self) -> impl Iterator<Item = (EndpointClass, PolicyConfig)> + '_ {
        [
            (EndpointClass::Login, self.login),
            (EndpointClass::OauthInitiate, self.oauth_initiate),
            (EndpointClass::OauthCallback, self.oauth_callback),
            (EndpointClass::TokenRefresh, self.token_refresh),
            (EndpointClass::Registration, self.registration),
            (EndpointClass::PasswordReset, self.password_reset),
        ]
        .into_iter()
        .filter_map(|(class, policy)| policy.map(|p| (class, p)))
    }
}

/// Back-end paths counted against a class when proxied with `POST`.
#[derive(Debug, Deserialize)]
pub struct PathRules {
    #[serde(default = "default_login_paths")]
    pub login: Vec<String>,
    #[serde(default = "default_registration_paths")]
    pub registration: Vec<String>,
    #[serde(default = "default_password_reset_paths")]
    pub password_reset: Vec<String>,
    #[serde(default = "default_token_refresh_paths")]
    pub token_refresh: Vec<String>,
}

impl Default for PathRules {
    fn default() -> Self {
        Self {
            login: default_login_paths(),
            registration: default_registration_paths(),
            password_reset: default_password_reset_paths(),
            token_refresh: default_token_refresh_paths(),
        }
    }
}

impl PathRules {
    /// Class for a proxied path, if any.
    ///
    /// Matching ignores ASCII case, percent-encoding, repeated and trailing
    /// slashes, since the back-end routes all of those to the same handler.
    pub fn classify(&self, path: &str) -> Option<EndpointClass> {
        let path = normalize_path(path);
        let matches = |rules: &[String]| {
            rules
                .iter()
                .any(|r| normalize_path(r).eq_ignore_ascii_case(&path))
        };
        if matches(&self.login) {
            Some(EndpointClass::Login)
        } else if matches(&self.registration) {
            Some(EndpointClass::Registration)
        } else if matches(&self.password_reset) {
            Some(EndpointClass::PasswordReset)
        } else if matches(&self.token_refresh) {
            Some(EndpointClass::TokenRefresh)
        } else {
            None
        }
    }
}

/// Percent-decode and drop empty segments: `//API/auth%2Flogin/` becomes
/// `/API/auth/login`.
fn normalize_path(path: &str) -> String {
    let decoded = urlencoding::decode(path).unwrap_or(Cow::Borrowed(path));
    let segments: Vec<&str> = decoded.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_session_ttl() -> u64 {
    8 * 60 * 60
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.json")
}

fn default_flow_ttl() -> u64 {
    600
}

fn default_exchange_timeout() -> u64 {
    10
}

fn default_max_pending_flows() -> usize {
    10_000
}

fn default_login_paths() -> Vec<String> {
    vec!["/api/auth/login".into()]
}

fn default_registration_paths() -> Vec<String> {
    vec!["/api/auth/register".into()]
}

fn default_password_reset_paths() -> Vec<String> {
    vec![
        "/api/auth/forgot-password".into(),
        "/api/auth/reset-password".into(),
    ]
}

fn default_token_refresh_paths() -> Vec<String> {
    vec!["/api/auth/refresh".into()]
}

fn config_err(msg: impl Into<String>) -> common::Error {
    common::Error::Config(msg.into())
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(config_err(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    url::Url::parse(value).map_err(|e| config_err(format!("{field} is not a valid URL: {e}")))?;
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then resolve provider secrets.
    ///
    /// Secret resolution order per provider:
    /// 1. env var named by `client_secret_env`
    /// 2. `client_secret_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        for provider in &mut config.providers {
            provider.client_secret = Secret::resolve(
                provider.client_secret_env.as_deref(),
                provider.client_secret_file.as_deref(),
            )?;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("upstream_url", &self.proxy.upstream_url)?;
        require_http_url("public_url", &self.server.public_url)?;

        if self.proxy.timeout_secs == 0 {
            return Err(config_err("timeout_secs must be greater than 0"));
        }
        if self.server.max_connections == 0 {
            return Err(config_err("max_connections must be greater than 0"));
        }
        if self.server.sweep_interval_secs == 0 {
            return Err(config_err("sweep_interval_secs must be greater than 0"));
        }
        if self.session.ttl_secs == 0 {
            return Err(config_err("session.ttl_secs must be greater than 0"));
        }
        if self.oauth.flow_ttl_secs == 0 {
            return Err(config_err("oauth.flow_ttl_secs must be greater than 0"));
        }
        if self.oauth.exchange_timeout_secs == 0 {
            return Err(config_err(
                "oauth.exchange_timeout_secs must be greater than 0",
            ));
        }
        if self.oauth.max_pending_flows == 0 {
            return Err(config_err("oauth.max_pending_flows must be greater than 0"));
        }

        for (class, policy) in self.rate_limit.policies.iter() {
            Policy::new(policy.limit, Duration::from_secs(policy.window_secs))
                .map_err(|e| config_err(format!("rate_limit.policies.{class}: {e}")))?;
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(config_err(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            // Builds the adapter once to surface kind-specific errors
            // (missing tenant, bad base URL, PKCE/state disabled) at load time.
            identity::build_provider(provider)
                .map_err(|e| config_err(e.to_string()))?;
            if provider.challenge_method == ChallengeMethod::Plain {
                warn!(
                    provider = %provider.name,
                    "provider uses the plain PKCE challenge method; prefer S256"
                );
            }
            if provider.kind == ProviderKind::AzureAd
                && provider.tenant_id.as_deref() == Some("common")
            {
                warn!(
                    provider = %provider.name,
                    "azure_ad tenant 'common' accepts any Microsoft account"
                );
            }
        }

        Ok(())
    }

    /// Rate limiter with the configured overrides and allowlist.
    pub fn rate_limiter(&self) -> RateLimiter {
        let mut limiter =
            RateLimiter::in_memory().with_allowlist(self.rate_limit.allowlist.iter().copied());
        for (class, policy) in self.rate_limit.policies.iter() {
            if let Ok(policy) = Policy::new(policy.limit, Duration::from_secs(policy.window_secs)) {
                limiter = limiter.with_policy(class, policy);
            }
        }
        limiter
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("boite-auth-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const BASE: &str = r#"
[server]
listen_addr = "127.0.0.1:8080"
public_url = "https://boite.example"

[proxy]
upstream_url = "http://127.0.0.1:5000"
"#;

    fn write_config(dir: &tempfile::TempDir, extra: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, format!("{BASE}{extra}")).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, "")).unwrap();

        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.sweep_interval_secs, 60);
        assert!(config.server.cookie_secure);
        assert_eq!(config.oauth.flow_ttl_secs, 600);
        assert_eq!(config.oauth.exchange_timeout_secs, 10);
        assert!(config.oauth.retry_on_timeout);
        assert_eq!(config.oauth.max_pending_flows, 10_000);
        assert!(!config.session.retain_provider_tokens);
        assert!(config.providers.is_empty());
        assert_eq!(
            config.rate_limit.paths.classify("/api/auth/login"),
            Some(EndpointClass::Login)
        );
    }

    #[test]
    fn full_config_parses() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("BAK_TEST_AZURE_SECRET", "azure-secret") };

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[[headers]]
name = "x-gateway"
value = "boite-auth"

[session]
ttl_secs = 3600
retain_provider_tokens = true

[oauth]
flow_ttl_secs = 300
retry_on_timeout = false

[rate_limit]
allowlist = ["10.0.0.5"]
trusted_proxies = ["10.0.0.1"]

[rate_limit.policies.login]
limit = 10
window_secs = 120

[rate_limit.paths]
login = ["/api/login"]

[[providers]]
name = "azure"
kind = "azure_ad"
client_id = "client-123"
client_secret_env = "BAK_TEST_AZURE_SECRET"
tenant_id = "tenant-1"
prompt = "select_account"

[[providers]]
name = "google"
kind = "google"
client_id = "g-client"

[[providers]]
name = "sso"
kind = "authentik"
client_id = "ak-client"
base_url = "https://sso.example.org"
challenge_method = "plain"
"#,
        );

        let config = Config::load(&path).unwrap();
        unsafe { remove_env("BAK_TEST_AZURE_SECRET") };

        assert_eq!(config.headers[0].name, "x-gateway");
        assert_eq!(config.session.ttl_secs, 3600);
        assert!(config.session.retain_provider_tokens);
        assert_eq!(config.oauth.flow_ttl_secs, 300);
        assert!(!config.oauth.retry_on_timeout);
        assert_eq!(config.rate_limit.allowlist, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            config.rate_limit.paths.classify("/api/login"),
            Some(EndpointClass::Login)
        );
        // Overriding one class keeps the defaults of the others
        assert_eq!(
            config.rate_limit.paths.classify("/api/auth/register"),
            Some(EndpointClass::Registration)
        );

        assert_eq!(config.providers.len(), 3);
        assert_eq!(
            config.providers[0].client_secret.as_ref().unwrap().expose(),
            "azure-secret"
        );
        assert!(config.providers[1].client_secret.is_none());
        assert_eq!(config.providers[2].challenge_method, ChallengeMethod::Plain);

        let limiter = config.rate_limiter();
        assert_eq!(limiter.policy(EndpointClass::Login).limit(), 10);
        assert_eq!(limiter.policy(EndpointClass::Registration).limit(), 3);
    }

    #[test]
    fn client_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BAK_TEST_GOOGLE_SECRET") };

        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("google_secret");
        std::fs::write(&secret_path, "file-secret\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[[providers]]
name = "google"
kind = "google"
client_id = "g-client"
client_secret_env = "BAK_TEST_GOOGLE_SECRET"
client_secret_file = "{}"
"#,
                secret_path.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.providers[0].client_secret.as_ref().unwrap().expose(),
            "file-secret"
        );
    }

    #[test]
    fn missing_secret_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("BAK_TEST_MISSING_SECRET") };

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[[providers]]
name = "google"
kind = "google"
client_id = "g-client"
client_secret_env = "BAK_TEST_MISSING_SECRET"
client_secret_file = "/nonexistent/secret"
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();
        assert!(Config::load(&path).is_err());
    }

    fn load_err(extra: &str) -> String {
        let dir = tempfile::tempdir().unwrap();
        Config::load(&write_config(&dir, extra))
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn invalid_upstream_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
public_url = "https://boite.example"

[proxy]
upstream_url = "127.0.0.1:5000"
"#,
        )
        .unwrap();
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("upstream_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn zero_values_rejected() {
        assert!(load_err("[oauth]\nflow_ttl_secs = 0\n").contains("flow_ttl_secs"));
        assert!(load_err("[oauth]\nexchange_timeout_secs = 0\n").contains("exchange_timeout_secs"));
        assert!(load_err("[oauth]\nmax_pending_flows = 0\n").contains("max_pending_flows"));
        assert!(load_err("[session]\nttl_secs = 0\n").contains("ttl_secs"));
        assert!(
            load_err("[rate_limit.policies.registration]\nlimit = 0\nwindow_secs = 60\n")
                .contains("registration")
        );
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let err = load_err(
            r#"
[[providers]]
name = "google"
kind = "google"
client_id = "a"

[[providers]]
name = "google"
kind = "google"
client_id = "b"
"#,
        );
        assert!(err.contains("duplicate provider name"), "got: {err}");
    }

    #[test]
    fn disabled_pkce_rejected() {
        let err = load_err(
            r#"
[[providers]]
name = "google"
kind = "google"
client_id = "a"
pkce = false
"#,
        );
        assert!(err.contains("PKCE"), "got: {err}");
    }

    #[test]
    fn disabled_state_rejected() {
        let err = load_err(
            r#"
[[providers]]
name = "google"
kind = "google"
client_id = "a"
state = false
"#,
        );
        assert!(err.contains("state"), "got: {err}");
    }

    #[test]
    fn azure_without_tenant_rejected() {
        let err = load_err(
            r#"
[[providers]]
name = "azure"
kind = "azure_ad"
client_id = "a"
"#,
        );
        assert!(err.contains("tenant_id"), "got: {err}");
    }

    #[test]
    fn unknown_challenge_method_rejected() {
        let err = load_err(
            r#"
[[providers]]
name = "google"
kind = "google"
client_id = "a"
challenge_method = "S512"
"#,
        );
        assert!(!err.is_empty());
    }

    #[test]
    fn path_classification_ignores_trailing_slash() {
        let rules = PathRules::default();
        assert_eq!(rules.classify("/api/auth/login/"), Some(EndpointClass::Login));
        assert_eq!(
            rules.classify("/api/auth/forgot-password"),
            Some(EndpointClass::PasswordReset)
        );
        assert_eq!(rules.classify("/api/ideas"), None);
        assert_eq!(rules.classify("/"), None);
    }

    #[test]
    fn path_classification_sees_through_case_and_slashes() {
        let rules = PathRules::default();
        assert_eq!(rules.classify("/API/AUTH/LOGIN"), Some(EndpointClass::Login));
        assert_eq!(rules.classify("//api/auth/login"), Some(EndpointClass::Login));
        assert_eq!(rules.classify("/api//auth///login//"), Some(EndpointClass::Login));
        assert_eq!(
            rules.classify("/api/auth/%72egister"),
            Some(EndpointClass::Registration)
        );
        assert_eq!(
            rules.classify("/Api/Auth/Reset-Password"),
            Some(EndpointClass::PasswordReset)
        );
        assert_eq!(rules.classify("/api/auth/loginx"), None);
        assert_eq!(rules.classify("/api/auth"), None);
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("boite-auth-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
