//! Pending-flow storage for code verifiers
//!
//! A pending flow holds the code verifier between the redirect to the
//! identity provider and the callback. Entries are keyed by the `state`
//! value of the attempt.
//!
//! Lifecycle: `store` right before the redirect, a single `take` (or
//! `retrieve` + `clear`) on callback. `take` is one critical section so two
//! concurrent callbacks carrying the same `state` cannot both obtain the
//! verifier.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use common::Secret;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pkce::ChallengeMethod;

/// Boxed future used by the dyn-compatible store trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lifetime class of a stored verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageScope {
    /// Short-lived, the normal choice.
    #[default]
    Session,
    /// Survives much longer. A stolen `state` stays useful for the whole
    /// window, so this is never the default.
    Persistent,
}

/// Verifier and metadata persisted across the authorization round trip.
#[derive(Debug, Clone)]
pub struct PendingFlow {
    /// Name of the configured provider that started the flow.
    pub provider: String,
    pub verifier: Secret<String>,
    pub method: ChallengeMethod,
    pub created_at: Instant,
}

impl PendingFlow {
    pub fn new(provider: impl Into<String>, verifier: String, method: ChallengeMethod) -> Self {
        Self {
            provider: provider.into(),
            verifier: Secret::new(verifier),
            method,
            created_at: Instant::now(),
        }
    }
}

/// Storage capability for pending flows.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn VerifierStore>`), so a shared backend can replace the in-memory
/// one when the gateway runs as several instances.
pub trait VerifierStore: Send + Sync {
    /// Persist a pending flow under `state`.
    ///
    /// Fails with `StoreUnavailable` when the backend cannot accept writes;
    /// callers must not redirect to the provider in that case.
    fn store<'a>(
        &'a self,
        state: &'a str,
        flow: PendingFlow,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<()>>;

    /// Read a pending flow without removing it.
    fn retrieve<'a>(
        &'a self,
        state: &'a str,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<Option<PendingFlow>>>;

    /// Remove a pending flow. Removing an absent entry is not an error.
    fn clear<'a>(&'a self, state: &'a str, scope: StorageScope) -> BoxFuture<'a, Result<()>>;

    /// Read and remove a pending flow in one step.
    fn take<'a>(
        &'a self,
        state: &'a str,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<Option<PendingFlow>>>;

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> BoxFuture<'_, usize>;

    /// Number of live entries (for health reporting).
    fn len(&self) -> BoxFuture<'_, usize>;
}

struct Entry {
    flow: PendingFlow,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Single-instance store backed by a mutex-guarded map.
///
/// Bounded by `capacity` so a burst of abandoned sign-ins cannot grow memory
/// without limit; once full (after dropping expired entries) writes fail
/// with `StoreUnavailable`.
pub struct InMemoryVerifierStore {
    entries: Mutex<HashMap<(StorageScope, String), Entry>>,
    session_ttl: Duration,
    persistent_ttl: Duration,
    capacity: usize,
}

/// Lifetime of `Persistent` entries.
pub const PERSISTENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

impl InMemoryVerifierStore {
    pub fn new(session_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            session_ttl,
            persistent_ttl: PERSISTENT_TTL,
            capacity,
        }
    }

    fn ttl(&self, scope: StorageScope) -> Duration {
        match scope {
            StorageScope::Session => self.session_ttl,
            StorageScope::Persistent => self.persistent_ttl,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(StorageScope, String), Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::StoreUnavailable("pending-flow map poisoned".into()))
    }

    fn store_sync(&self, state: &str, flow: PendingFlow, scope: StorageScope) -> Result<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        let key = (scope, state.to_string());

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, e| !e.is_expired(now));
            if entries.len() >= self.capacity {
                warn!(
                    capacity = self.capacity,
                    "pending-flow store full, refusing new sign-in"
                );
                return Err(Error::StoreUnavailable(format!(
                    "{} pending sign-ins already in progress",
                    self.capacity
                )));
            }
        }

        if scope == StorageScope::Persistent {
            warn!(provider = %flow.provider, "storing verifier with persistent scope");
        }

        let expires_at = now + self.ttl(scope);
        entries.insert(key, Entry { flow, expires_at });
        debug!(?scope, "stored pending flow");
        Ok(())
    }

    fn retrieve_sync(&self, state: &str, scope: StorageScope) -> Result<Option<PendingFlow>> {
        let mut entries = self.lock()?;
        let key = (scope, state.to_string());
        let now = Instant::now();
        match entries.get(&key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(&key);
                debug!(?scope, "pending flow expired");
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.flow.clone())),
            None => Ok(None),
        }
    }

    fn take_sync(&self, state: &str, scope: StorageScope) -> Result<Option<PendingFlow>> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        match entries.remove(&(scope, state.to_string())) {
            Some(entry) if entry.is_expired(now) => {
                debug!(?scope, "pending flow expired");
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.flow)),
            None => Ok(None),
        }
    }

    fn clear_sync(&self, state: &str, scope: StorageScope) -> Result<()> {
        let mut entries = self.lock()?;
        entries.remove(&(scope, state.to_string()));
        Ok(())
    }
}

impl VerifierStore for InMemoryVerifierStore {
    fn store<'a>(
        &'a self,
        state: &'a str,
        flow: PendingFlow,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.store_sync(state, flow, scope) })
    }

    fn retrieve<'a>(
        &'a self,
        state: &'a str,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<Option<PendingFlow>>> {
        Box::pin(async move { self.retrieve_sync(state, scope) })
    }

    fn clear<'a>(&'a self, state: &'a str, scope: StorageScope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.clear_sync(state, scope) })
    }

    fn take<'a>(
        &'a self,
        state: &'a str,
        scope: StorageScope,
    ) -> BoxFuture<'a, Result<Option<PendingFlow>>> {
        Box::pin(async move { self.take_sync(state, scope) })
    }

    fn purge_expired(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let Ok(mut entries) = self.lock() else {
                return 0;
            };
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired(now));
            before - entries.len()
        })
    }

    fn len(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.lock().map(|e| e.len()).unwrap_or(0) })
    }
}
