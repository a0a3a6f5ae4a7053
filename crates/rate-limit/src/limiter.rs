//! Per-client, per-endpoint-class rate limiter

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::policy::{Decision, EndpointClass, Policy};
use crate::store::{CounterStore, InMemoryCounterStore};

/// Sliding-window limiter keyed by `(endpoint class, client IP)`.
///
/// Counters live in an injected `CounterStore`; time comes from an injected
/// `Clock`. Addresses on the allowlist are never counted.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policies: HashMap<EndpointClass, Policy>,
    allowlist: HashSet<IpAddr>,
}

impl RateLimiter {
    /// Limiter with built-in policies, no allowlist.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        let policies = EndpointClass::ALL
            .into_iter()
            .map(|class| (class, class.default_policy()))
            .collect();
        Self {
            store,
            clock,
            policies,
            allowlist: HashSet::new(),
        }
    }

    /// In-memory store and system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()), Arc::new(SystemClock))
    }

    pub fn with_policy(mut self, class: EndpointClass, policy: Policy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn with_allowlist(mut self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.allowlist.extend(addrs);
        self
    }

    pub fn policy(&self, class: EndpointClass) -> Policy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }

    /// Count one request from `client` against `class`.
    pub async fn check(&self, class: EndpointClass, client: IpAddr) -> Result<Decision> {
        let policy = self.policy(class);
        if self.allowlist.contains(&client) {
            return Ok(Decision::Allowed {
                remaining: policy.limit(),
            });
        }

        let key = bucket_key(class, client);
        let decision = self.store.hit(&key, policy, self.clock.now()).await?;
        match decision {
            Decision::Allowed { remaining } => {
                debug!(class = class.as_str(), %client, remaining, "rate limit check passed");
            }
            Decision::Throttled { retry_after, limit } => {
                warn!(
                    class = class.as_str(),
                    %client,
                    limit,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "rate limit exceeded"
                );
            }
        }
        Ok(decision)
    }

    /// Drop idle buckets.
    pub async fn purge(&self) -> Result<usize> {
        self.store.purge(self.clock.now()).await
    }
}

fn bucket_key(class: EndpointClass, client: IpAddr) -> String {
    format!("{}:{client}", class.as_str())
}

/// Resolve the address a request should be counted against.
///
/// The socket peer is authoritative. `X-Forwarded-For` is consulted only when
/// the peer is a trusted proxy; the list is then walked right to left and the
/// first hop that is not itself a trusted proxy wins. Unparseable entries stop
/// the walk so a client cannot inject an address behind garbage.
pub fn client_ip(peer: IpAddr, forwarded_for: Option<&str>, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }
    let Some(header) = forwarded_for else {
        return peer;
    };

    let mut candidate = peer;
    for hop in header.rsplit(',').map(str::trim) {
        match hop.parse::<IpAddr>() {
            Ok(addr) => {
                candidate = addr;
                if !trusted_proxies.contains(&addr) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    candidate
}
