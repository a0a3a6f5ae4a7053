//! Endpoint classes and their default policies

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Auth-sensitive endpoint families, each with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Login,
    OauthInitiate,
    OauthCallback,
    TokenRefresh,
    Registration,
    PasswordReset,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 6] = [
        EndpointClass::Login,
        EndpointClass::OauthInitiate,
        EndpointClass::OauthCallback,
        EndpointClass::TokenRefresh,
        EndpointClass::Registration,
        EndpointClass::PasswordReset,
    ];

    /// Label for logs, metrics and bucket keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Login => "login",
            EndpointClass::OauthInitiate => "oauth_initiate",
            EndpointClass::OauthCallback => "oauth_callback",
            EndpointClass::TokenRefresh => "token_refresh",
            EndpointClass::Registration => "registration",
            EndpointClass::PasswordReset => "password_reset",
        }
    }

    /// Built-in budget for the class.
    ///
    /// | class | limit | window |
    /// |---|---|---|
    /// | login | 5 | 60 s |
    /// | OAuth initiate | 10 | 60 s |
    /// | OAuth callback | 10 | 60 s |
    /// | token refresh | 10 | 60 s |
    /// | registration | 3 | 1 h |
    /// | password reset | 3 | 1 h |
    pub fn default_policy(&self) -> Policy {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(3600);
        match self {
            EndpointClass::Login => Policy::new_unchecked(5, MINUTE),
            EndpointClass::OauthInitiate => Policy::new_unchecked(10, MINUTE),
            EndpointClass::OauthCallback => Policy::new_unchecked(10, MINUTE),
            EndpointClass::TokenRefresh => Policy::new_unchecked(10, MINUTE),
            EndpointClass::Registration => Policy::new_unchecked(3, HOUR),
            EndpointClass::PasswordReset => Policy::new_unchecked(3, HOUR),
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `limit` requests in any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u32,
    window: Duration,
}

impl Policy {
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidPolicy("limit must be greater than 0".into()));
        }
        if window.is_zero() {
            return Err(Error::InvalidPolicy("window must be greater than 0".into()));
        }
        Ok(Self { limit, window })
    }

    const fn new_unchecked(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Outcome of a single counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Counted; `remaining` more requests fit in the current window.
    Allowed { remaining: u32 },
    /// Not counted; the oldest hit leaves the window after `retry_after`.
    Throttled { retry_after: Duration, limit: u32 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}
