//! Server-side sessions
//!
//! The browser only holds an opaque session id in an HttpOnly cookie; the
//! identity behind it stays here. Sessions expire after a fixed TTL and are
//! swept by the background task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use common::Secret;
use identity::{TokenResponse, UserRecord};
use serde::Serialize;
use tracing::debug;

pub const SESSION_COOKIE: &str = "bak_session";

/// Provider tokens kept alongside a session when retention is enabled.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub id_token: Option<Secret<String>>,
}

impl From<TokenResponse> for ProviderTokens {
    fn from(tokens: TokenResponse) -> Self {
        Self {
            access_token: Secret::new(tokens.access_token),
            refresh_token: tokens.refresh_token.map(Secret::new),
            id_token: tokens.id_token.map(Secret::new),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    /// Unix milliseconds.
    pub created_at: u64,
    pub expires_at: Instant,
    pub provider_tokens: Option<ProviderTokens>,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Public view of a session, returned by `GET /auth/session`.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    pub created_at: u64,
    pub expires_in_secs: u64,
}

impl SessionView {
    pub fn new(session: &Session) -> Self {
        Self {
            provider: session.provider.clone(),
            provider_user_id: session.provider_user_id.clone(),
            email: session.email.clone(),
            display_name: session.display_name.clone(),
            created_at: session.created_at,
            expires_in_secs: session
                .expires_at
                .saturating_duration_since(Instant::now())
                .as_secs(),
        }
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session for a freshly signed-in user.
    pub fn create(&self, user: &UserRecord, tokens: Option<ProviderTokens>) -> Session {
        let session = Session {
            id: new_session_id(),
            provider: user.provider.clone(),
            provider_user_id: user.profile.provider_user_id.clone(),
            email: user.profile.email.clone(),
            display_name: user.profile.display_name.clone(),
            created_at: now_millis(),
            expires_at: Instant::now() + self.ttl,
            provider_tokens: tokens,
        };
        self.lock().insert(session.id.clone(), session.clone());
        debug!(provider = %session.provider, "session created");
        session
    }

    /// Live session for `id`. Expired sessions are dropped on sight.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        match sessions.get(id) {
            Some(s) if s.is_expired(Instant::now()) => {
                sessions.remove(id);
                None
            }
            Some(s) => Some(s.clone()),
            None => None,
        }
    }

    /// Replace `id` with a new id and a fresh expiry. The old id stops
    /// working immediately.
    pub fn rotate(&self, id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        let mut session = sessions.remove(id)?;
        let now = Instant::now();
        if session.is_expired(now) {
            return None;
        }
        session.id = new_session_id();
        session.expires_at = now + self.ttl;
        sessions.insert(session.id.clone(), session.clone());
        Some(session)
    }

    /// Returns whether a session was removed.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
