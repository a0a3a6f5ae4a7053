//! Error types for identity provider operations

use crate::profile::ProfileMappingError;

/// Errors from provider configuration, token exchange and user storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("userinfo request failed: {0}")]
    Userinfo(String),

    #[error(transparent)]
    ProfileMapping(#[from] ProfileMappingError),

    #[error("user store parse error: {0}")]
    UserParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the failure was a network timeout (the one retryable case).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result alias for identity operations.
pub type Result<T> = std::result::Result<T, Error>;
