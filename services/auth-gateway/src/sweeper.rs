//! Background expiry sweep
//!
//! Expired entries are already invisible on the request path; this task only
//! reclaims their memory so idle buckets, abandoned sign-ins and dead sessions
//! do not accumulate.

use std::sync::Arc;
use std::time::Duration;

use pkce::VerifierStore;
use rate_limit::RateLimiter;
use tracing::{debug, warn};

use crate::session::SessionStore;

/// What one sweep removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub buckets: usize,
    pub flows: usize,
    pub sessions: usize,
}

/// Spawn a task that sweeps every `interval`.
pub fn spawn_sweep_task(
    limiter: Arc<RateLimiter>,
    verifiers: Arc<dyn VerifierStore>,
    sessions: Arc<SessionStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Nothing to sweep at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&limiter, verifiers.as_ref(), &sessions).await;
        }
    })
}

pub async fn sweep_cycle(
    limiter: &RateLimiter,
    verifiers: &dyn VerifierStore,
    sessions: &SessionStore,
) -> SweepReport {
    let buckets = match limiter.purge().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "rate limit purge failed");
            0
        }
    };
    let report = SweepReport {
        buckets,
        flows: verifiers.purge_expired().await,
        sessions: sessions.purge_expired(),
    };
    if report != SweepReport::default() {
        debug!(
            buckets = report.buckets,
            flows = report.flows,
            sessions = report.sessions,
            "expired entries swept"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::{CanonicalProfile, UserRecord};
    use pkce::{ChallengeMethod, InMemoryVerifierStore, PendingFlow, StorageScope};

    fn user() -> UserRecord {
        UserRecord {
            provider: "google".into(),
            profile: CanonicalProfile {
                provider_user_id: "1".into(),
                email: "a@b.c".into(),
                display_name: "A".into(),
                given_name: "A".into(),
                family_name: String::new(),
                tenant_id: None,
                profile_picture_url: None,
            },
            created_at: 0,
            last_login_at: 0,
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_flows_and_sessions() {
        let limiter = RateLimiter::in_memory();
        let verifiers = InMemoryVerifierStore::new(Duration::ZERO, 10);
        verifiers
            .store(
                "state-1",
                PendingFlow::new("google", "v".repeat(43), ChallengeMethod::S256),
                StorageScope::Session,
            )
            .await
            .unwrap();
        let sessions = SessionStore::new(Duration::ZERO);
        sessions.create(&user(), None);

        let report = sweep_cycle(&limiter, &verifiers, &sessions).await;
        assert_eq!(report.flows, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(verifiers.len().await, 0);
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_live_entries() {
        let limiter = RateLimiter::in_memory();
        let verifiers = InMemoryVerifierStore::new(Duration::from_secs(600), 10);
        verifiers
            .store(
                "state-1",
                PendingFlow::new("google", "v".repeat(43), ChallengeMethod::S256),
                StorageScope::Session,
            )
            .await
            .unwrap();
        let sessions = SessionStore::new(Duration::from_secs(600));
        sessions.create(&user(), None);

        let report = sweep_cycle(&limiter, &verifiers, &sessions).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(verifiers.len().await, 1);
        assert_eq!(sessions.len(), 1);
    }
}
