//! Error types for PKCE and pending-flow storage

/// Errors from PKCE generation, URL building and verifier storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid code verifier: {0}")]
    InvalidVerifierFormat(String),

    #[error("verifier storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid authorization endpoint: {0}")]
    AuthorizationUrl(String),
}

/// Result alias for PKCE operations.
pub type Result<T> = std::result::Result<T, Error>;
