//! Authentik adapter
//!
//! Endpoints hang off the instance base URL (`/application/o/...`), shared by
//! every application on the instance.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::profile::{
    CanonicalProfile, ProfileMappingError, normalize_email, resolve_names, str_field,
};
use crate::{IdentityProvider, ProviderKind, ProviderSettings, ProviderSpec};

const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];

pub struct AuthentikProvider {
    settings: ProviderSettings,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

impl AuthentikProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Result<Self> {
        let base = spec
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("provider {}: authentik requires base_url", spec.name))
            })?;
        if !base.starts_with("https://") && !base.starts_with("http://") {
            return Err(Error::Config(format!(
                "provider {}: base_url must start with http:// or https://, got: {base}",
                spec.name
            )));
        }
        let base = base.trim_end_matches('/');

        Ok(Self {
            settings: ProviderSettings::from_spec(spec, DEFAULT_SCOPES),
            authorization_endpoint: format!("{base}/application/o/authorize/"),
            token_endpoint: format!("{base}/application/o/token/"),
            userinfo_endpoint: format!("{base}/application/o/userinfo/"),
        })
    }
}

impl IdentityProvider for AuthentikProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Authentik
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn authorization_endpoint(&self) -> &str {
        &self.authorization_endpoint
    }

    fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    fn userinfo_endpoint(&self) -> Option<&str> {
        Some(&self.userinfo_endpoint)
    }

    fn map_profile(
        &self,
        payload: &Value,
    ) -> std::result::Result<CanonicalProfile, ProfileMappingError> {
        let provider_user_id =
            str_field(payload, "sub").ok_or(ProfileMappingError::MissingField("sub"))?;
        let raw_email =
            str_field(payload, "email").ok_or(ProfileMappingError::MissingField("email"))?;
        let email = normalize_email(raw_email)?;

        let display_name = str_field(payload, "name")
            .or_else(|| str_field(payload, "preferred_username"))
            .map(str::to_string)
            .unwrap_or_else(|| email.clone());
        let (given_name, family_name) = resolve_names(
            &display_name,
            str_field(payload, "given_name"),
            str_field(payload, "family_name"),
        );

        Ok(CanonicalProfile {
            provider_user_id: provider_user_id.to_string(),
            email,
            display_name,
            given_name,
            family_name,
            tenant_id: None,
            profile_picture_url: str_field(payload, "picture").map(str::to_string),
        })
    }
}
