//! Canonical user profile and the helpers adapters use to build it
//!
//! Every adapter normalizes its provider payload into `CanonicalProfile`
//! before anything else in the gateway sees the user. Missing required
//! fields are hard failures, never empty strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider-agnostic user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProfile {
    /// Stable identifier at the provider; the key for local user records.
    pub provider_user_id: String,
    /// Lower-cased email address.
    pub email: String,
    pub display_name: String,
    pub given_name: String,
    pub family_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

/// A provider payload could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileMappingError {
    #[error("provider profile is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("provider returned an unusable email address: {0:?}")]
    InvalidEmail(String),

    #[error("provider reports email {0} as unverified")]
    UnverifiedEmail(String),

    #[error("provider payload is malformed: {0}")]
    InvalidPayload(String),
}

/// Non-empty, trimmed string at `key`.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Non-empty, trimmed string at a nested path.
pub(crate) fn str_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let (last, parents) = path.split_last()?;
    let mut current = value;
    for key in parents {
        current = current.get(*key)?;
    }
    str_field(current, last)
}

/// Trim and lower-case an email, rejecting values without a local part and
/// a domain.
pub(crate) fn normalize_email(raw: &str) -> Result<String, ProfileMappingError> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(email)
        }
        _ => Err(ProfileMappingError::InvalidEmail(raw.to_string())),
    }
}

/// Split a display name into given and family name: the first word is the
/// given name, the remainder the family name.
pub(crate) fn split_display_name(display_name: &str) -> (String, String) {
    let mut parts = display_name.split_whitespace();
    let given = parts.next().unwrap_or_default().to_string();
    let family = parts.collect::<Vec<_>>().join(" ");
    (given, family)
}

/// `email_verified` explicitly false (bool or string form).
pub(crate) fn email_marked_unverified(value: &Value) -> bool {
    match value.get("email_verified") {
        Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

/// Resolve given/family names from explicit claims, falling back to
/// splitting the display name for whichever is missing.
pub(crate) fn resolve_names(
    display_name: &str,
    given: Option<&str>,
    family: Option<&str>,
) -> (String, String) {
    let (split_given, split_family) = split_display_name(display_name);
    (
        given.map(str::to_string).unwrap_or(split_given),
        family.map(str::to_string).unwrap_or(split_family),
    )
}
