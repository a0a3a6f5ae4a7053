//! Azure AD (Microsoft identity platform v2.0) adapter
//!
//! Azure's profile comes from the ID token. Its claims are first arranged
//! into the classic Azure profile shape (`oid`, `displayName`, `emails[]`,
//! `userPrincipalName`, raw claims under `_json`) and then mapped, so payloads
//! produced by other Azure integrations map the same way.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::profile::{
    CanonicalProfile, ProfileMappingError, normalize_email, resolve_names, str_field, str_path,
};
use crate::token::TokenResponse;
use crate::{IdentityProvider, ProviderKind, ProviderSettings, ProviderSpec};

const LOGIN_BASE: &str = "https://login.microsoftonline.com";

const DEFAULT_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

pub struct AzureAdProvider {
    settings: ProviderSettings,
    authorization_endpoint: String,
    token_endpoint: String,
}

impl AzureAdProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Result<Self> {
        let tenant_id = spec
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("provider {}: azure_ad requires tenant_id", spec.name))
            })?;

        Ok(Self {
            settings: ProviderSettings::from_spec(spec, DEFAULT_SCOPES),
            authorization_endpoint: format!("{LOGIN_BASE}/{tenant_id}/oauth2/v2.0/authorize"),
            token_endpoint: format!("{LOGIN_BASE}/{tenant_id}/oauth2/v2.0/token"),
        })
    }
}

/// Arrange ID token claims into the Azure profile shape.
fn claims_to_profile(claims: Value) -> Value {
    let emails: Vec<Value> = str_field(&claims, "email")
        .map(|e| vec![json!({ "value": e })])
        .unwrap_or_default();
    let upn = str_field(&claims, "preferred_username").or_else(|| str_field(&claims, "upn"));

    json!({
        "oid": str_field(&claims, "oid"),
        "displayName": str_field(&claims, "name"),
        "emails": emails,
        "userPrincipalName": upn,
        "name": {
            "givenName": str_field(&claims, "given_name"),
            "familyName": str_field(&claims, "family_name"),
        },
        "_json": claims,
    })
}

impl IdentityProvider for AzureAdProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureAd
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
        None
    }

    fn profile_payload(
        &self,
        tokens: &TokenResponse,
        _userinfo: Option<Value>,
    ) -> std::result::Result<Value, ProfileMappingError> {
        Ok(claims_to_profile(tokens.id_token_claims()?))
    }

    fn map_profile(
        &self,
        payload: &Value,
    ) -> std::result::Result<CanonicalProfile, ProfileMappingError> {
        let provider_user_id = str_field(payload, "oid")
            .or_else(|| str_path(payload, &["_json", "oid"]))
            .ok_or(ProfileMappingError::MissingField("oid"))?;

        let first_email = payload
            .get("emails")
            .and_then(|e| e.get(0))
            .and_then(|e| str_field(e, "value"));
        let raw_email = first_email
            .or_else(|| str_field(payload, "userPrincipalName"))
            .or_else(|| str_path(payload, &["_json", "email"]))
            .ok_or(ProfileMappingError::MissingField("email"))?;
        let email = normalize_email(raw_email)?;

        let display_name = str_field(payload, "displayName")
            .or_else(|| str_path(payload, &["_json", "name"]))
            .map(str::to_string)
            .unwrap_or_else(|| email.clone());

        let given = str_path(payload, &["name", "givenName"])
            .or_else(|| str_path(payload, &["_json", "given_name"]));
        let family = str_path(payload, &["name", "familyName"])
            .or_else(|| str_path(payload, &["_json", "family_name"]));
        let (given_name, family_name) = resolve_names(&display_name, given, family);

        Ok(CanonicalProfile {
            provider_user_id: provider_user_id.to_string(),
            email,
            display_name,
            given_name,
            family_name,
            tenant_id: str_path(payload, &["_json", "tid"]).map(str::to_string),
            profile_picture_url: None,
        })
    }
}
