//! Counter storage for sliding-window buckets
//!
//! `CounterStore::hit` is the only write path and performs check-then-record
//! as a single atomic step, so concurrent requests can never both take the
//! last slot of a window. A shared backend (e.g. Redis with a Lua script)
//! plugs in behind the same trait when the gateway runs as several replicas.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::policy::{Decision, Policy};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait CounterStore: Send + Sync {
    /// Count one request against `key` under `policy` at time `now`.
    ///
    /// Throttled requests are not recorded.
    fn hit<'a>(&'a self, key: &'a str, policy: Policy, now: Instant)
    -> BoxFuture<'a, Result<Decision>>;

    /// Drop buckets with no hit inside their window. Returns how many were
    /// removed.
    fn purge(&self, now: Instant) -> BoxFuture<'_, Result<usize>>;
}

struct Bucket {
    window: std::time::Duration,
    hits: VecDeque<Instant>,
}

impl Bucket {
    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-local sliding-log store.
///
/// Each bucket keeps the timestamps of its accepted hits, so the window
/// slides exactly rather than resetting at fixed boundaries.
#[derive(Default)]
pub struct InMemoryCounterStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit_sync(&self, key: &str, policy: Policy, now: Instant) -> Result<Decision> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| Error::Store("counter mutex poisoned".into()))?;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            window: policy.window(),
            hits: VecDeque::new(),
        });
        bucket.window = policy.window();
        bucket.evict(now);

        let used = bucket.hits.len() as u32;
        if used < policy.limit() {
            bucket.hits.push_back(now);
            return Ok(Decision::Allowed {
                remaining: policy.limit() - used - 1,
            });
        }

        let retry_after = bucket
            .hits
            .front()
            .map(|&oldest| (oldest + policy.window()).saturating_duration_since(now))
            .unwrap_or(policy.window());
        Ok(Decision::Throttled {
            retry_after,
            limit: policy.limit(),
        })
    }

    fn purge_sync(&self, now: Instant) -> Result<usize> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| Error::Store("counter mutex poisoned".into()))?;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.evict(now);
            !bucket.hits.is_empty()
        });
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, remaining = buckets.len(), "purged idle rate limit buckets");
        }
        Ok(removed)
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for InMemoryCounterStore {
    fn hit<'a>(
        &'a self,
        key: &'a str,
        policy: Policy,
        now: Instant,
    ) -> BoxFuture<'a, Result<Decision>> {
        Box::pin(async move { self.hit_sync(key, policy, now) })
    }

    fn purge(&self, now: Instant) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { self.purge_sync(now) })
    }
}
