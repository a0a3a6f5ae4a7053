//! Google (OpenID Connect) adapter

use serde_json::Value;

use crate::profile::{
    CanonicalProfile, ProfileMappingError, email_marked_unverified, normalize_email,
    resolve_names, str_field,
};
use crate::{IdentityProvider, ProviderKind, ProviderSettings, ProviderSpec};

const AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];

pub struct GoogleProvider {
    settings: ProviderSettings,
}

impl GoogleProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Self {
        Self {
            settings: ProviderSettings::from_spec(spec, DEFAULT_SCOPES),
        }
    }
}

impl IdentityProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn authorization_endpoint(&self) -> &str {
        AUTHORIZATION_ENDPOINT
    }

    fn token_endpoint(&self) -> &str {
        TOKEN_ENDPOINT
    }

    fn userinfo_endpoint(&self) -> Option<&str> {
        Some(USERINFO_ENDPOINT)
    }

    /// Maps the OIDC userinfo document. `hd` (Workspace hosted domain)
    /// becomes the tenant.
    fn map_profile(
        &self,
        payload: &Value,
    ) -> std::result::Result<CanonicalProfile, ProfileMappingError> {
        let provider_user_id =
            str_field(payload, "sub").ok_or(ProfileMappingError::MissingField("sub"))?;
        let raw_email =
            str_field(payload, "email").ok_or(ProfileMappingError::MissingField("email"))?;
        let email = normalize_email(raw_email)?;
        if email_marked_unverified(payload) {
            return Err(ProfileMappingError::UnverifiedEmail(email));
        }

        let display_name = str_field(payload, "name")
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
            tenant_id: str_field(payload, "hd").map(str::to_string),
            profile_picture_url: str_field(payload, "picture").map(str::to_string),
        })
    }
}
