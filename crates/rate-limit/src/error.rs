//! Error types for rate limiting

/// Errors from the limiter or its counter store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The counter backend could not be reached or is poisoned.
    #[error("counter store unavailable: {0}")]
    Store(String),

    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(String),
}

/// Result alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, Error>;
