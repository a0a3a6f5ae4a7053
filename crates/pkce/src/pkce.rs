//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier, the code challenge and the anti-CSRF `state`
//! value used during the authorization code flow. The verifier stays in the
//! gateway's pending-flow store and is only sent during token exchange; the
//! challenge travels in the authorization URL so the identity provider can
//! check that the exchange comes from the party that started the flow.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Shortest verifier RFC 7636 accepts.
pub const MIN_VERIFIER_LEN: usize = 43;

/// Longest verifier RFC 7636 accepts.
pub const MAX_VERIFIER_LEN: usize = 128;

/// Random bytes behind a verifier. 96 bytes encode to exactly 128 base64url
/// characters, the RFC maximum.
const VERIFIER_BYTES: usize = 96;

/// Random bytes behind a `state` value.
const STATE_BYTES: usize = 32;

/// How the code challenge is derived from the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum ChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`
    #[default]
    #[serde(rename = "S256")]
    S256,
    /// Challenge equals the verifier. Only for providers that cannot do S256.
    #[serde(rename = "plain")]
    Plain,
}

impl ChallengeMethod {
    /// Value sent as `code_challenge_method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::S256 => "S256",
            ChallengeMethod::Plain => "plain",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verifier/challenge pair for a single authorization attempt.
#[derive(Clone)]
pub struct PkceParams {
    pub code_verifier: String,
    pub code_challenge: String,
    pub method: ChallengeMethod,
}

impl PkceParams {
    /// Generate a fresh verifier and derive its challenge.
    pub fn generate(method: ChallengeMethod) -> Self {
        let code_verifier = generate_verifier();
        let code_challenge = compute_challenge(&code_verifier, method);
        Self {
            code_verifier,
            code_challenge,
            method,
        }
    }

    /// Build params around an externally supplied verifier, rejecting it
    /// before it can reach the network if it is malformed.
    pub fn from_verifier(verifier: &str, method: ChallengeMethod) -> Result<Self> {
        if !is_valid_verifier(verifier) {
            return Err(Error::InvalidVerifierFormat(format!(
                "verifier must be {MIN_VERIFIER_LEN}-{MAX_VERIFIER_LEN} characters from [A-Za-z0-9-._~], got {} characters",
                verifier.len()
            )));
        }
        Ok(Self {
            code_verifier: verifier.to_string(),
            code_challenge: compute_challenge(verifier, method),
            method,
        })
    }
}

// The verifier must never end up in logs.
impl fmt::Debug for PkceParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceParams")
            .field("code_verifier", &"[REDACTED]")
            .field("code_challenge", &self.code_challenge)
            .field("method", &self.method)
            .finish()
    }
}

/// Generate a cryptographically random PKCE code verifier.
///
/// Draws from the thread-local CSPRNG and encodes as URL-safe base64 without
/// padding, which only produces characters from the unreserved set.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an opaque `state` value with the same CSPRNG guarantees as the
/// verifier.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the code challenge for a verifier.
///
/// `S256`: `challenge = BASE64URL(SHA256(utf8(verifier)))`.
/// `plain`: the verifier itself.
pub fn compute_challenge(verifier: &str, method: ChallengeMethod) -> String {
    match method {
        ChallengeMethod::S256 => {
            let hash = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(hash)
        }
        ChallengeMethod::Plain => verifier.to_string(),
    }
}

/// Check length and charset of a verifier per RFC 7636 §4.1.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier.bytes().all(is_unreserved)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}
