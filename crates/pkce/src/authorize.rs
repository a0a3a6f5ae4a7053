//! Authorization request URL construction
//!
//! Builds the URL the browser is redirected to when a sign-in starts. All
//! parameter values are percent-encoded by `url`, so scopes, redirect URIs
//! and provider-specific extras can carry arbitrary characters.

use url::Url;

use crate::error::{Error, Result};
use crate::pkce::PkceParams;

/// Provider-side parameters of an authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    /// Extra query parameters some providers want (e.g. `prompt`).
    pub extra_params: &'a [(String, String)],
}

/// Build the full authorization URL with all required OAuth parameters.
///
/// The `state` value must be the one persisted with the pending flow; the
/// identity provider echoes it back unchanged on callback.
pub fn build_authorization_url(
    request: &AuthorizationRequest<'_>,
    pkce: &PkceParams,
    state: &str,
) -> Result<Url> {
    let mut url = Url::parse(request.endpoint)
        .map_err(|e| Error::AuthorizationUrl(format!("{}: {e}", request.endpoint)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", request.client_id)
            .append_pair("redirect_uri", request.redirect_uri)
            .append_pair("scope", &request.scopes.join(" "))
            .append_pair("code_challenge", &pkce.code_challenge)
            .append_pair("code_challenge_method", pkce.method.as_str())
            .append_pair("state", state);
        for (name, value) in request.extra_params {
            query.append_pair(name, value);
        }
    }

    Ok(url)
}
