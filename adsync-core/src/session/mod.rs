//! Authenticated browser sessions: login, liveness, recovery and leasing.

mod login;
mod manager;
mod operator;
mod pool;

pub use login::LoginFlow;
pub use manager::{Session, SessionContext, SessionManager};
pub use operator::{ConsoleOperatorGate, OperatorGate, UnattendedOperatorGate};
pub use pool::{SessionLease, SessionPool};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::browser::{
        metrics_snapshot, BrowserError, BrowserMetrics, BrowserResult, SessionRecovery,
        SimulatedMarketplace, SiteMap,
    };
    use crate::config::{
        ChallengePolicy, LoginSection, SelectorSection, SessionMode, SessionSection, SiteSection,
    };

    struct SolvingGate(SimulatedMarketplace);

    #[async_trait]
    impl OperatorGate for SolvingGate {
        async fn await_operator(&self, _message: &str) -> BrowserResult<()> {
            self.0.solve_challenge();
            Ok(())
        }
    }

    fn setup(config: SessionSection) -> (SimulatedMarketplace, SessionContext) {
        let site = SiteMap::new(SiteSection::default(), SelectorSection::default(), &config);
        let market = SimulatedMarketplace::new(site.clone(), "seller@example.com", "secret");
        let ctx = SessionContext {
            factory: Arc::new(market.clone()),
            site: Arc::new(site),
            login: LoginSection {
                username: "seller@example.com".into(),
                password: "secret".into(),
            },
            config,
            operator: Arc::new(SolvingGate(market.clone())),
            metrics: Arc::new(Mutex::new(BrowserMetrics::default())),
            cancel: CancellationToken::new(),
        };
        (market, ctx)
    }

    #[tokio::test]
    async fn acquire_reuses_live_session() {
        let (market, ctx) = setup(SessionSection::default());
        let manager = SessionManager::new(0, ctx);
        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(market.login_count(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced_on_acquire() {
        let (market, ctx) = setup(SessionSection::default());
        let manager = SessionManager::new(0, ctx);
        let first = manager.acquire().await.unwrap();
        market.expire_sessions();
        assert!(!manager.is_alive(&first).await.unwrap());
        let second = manager.acquire().await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(market.login_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_recoveries_log_in_once() {
        let (market, ctx) = setup(SessionSection::default());
        let manager = SessionManager::new(0, ctx);
        let session = manager.acquire().await.unwrap();
        market.expire_sessions();
        let stale = session.generation();
        let (a, b) = tokio::join!(manager.reauthenticate(stale), manager.reauthenticate(stale));
        assert_eq!(a.unwrap().generation(), b.unwrap().generation());
        assert_eq!(market.login_count(), 2);
    }

    #[tokio::test]
    async fn invalid_credentials_block_authentication() {
        let (market, ctx) = setup(SessionSection::default());
        market.configure(|faults| faults.reject_credentials = true);
        let manager = SessionManager::new(0, ctx);
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, BrowserError::AuthenticationBlocked(_)));
    }

    #[tokio::test]
    async fn challenge_with_fail_policy_blocks() {
        let (market, ctx) = setup(SessionSection {
            challenge_policy: ChallengePolicy::Fail,
            ..SessionSection::default()
        });
        market.configure(|faults| faults.challenge_on_login = true);
        let manager = SessionManager::new(0, ctx);
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, BrowserError::AuthenticationBlocked(_)));
    }

    #[tokio::test]
    async fn challenge_with_pause_policy_waits_for_operator() {
        let (market, ctx) = setup(SessionSection::default());
        market.configure(|faults| faults.challenge_on_login = true);
        let metrics = Arc::clone(&ctx.metrics);
        let manager = SessionManager::new(0, ctx);
        manager.acquire().await.unwrap();
        assert_eq!(metrics_snapshot(&metrics).challenges, 1);
        assert_eq!(market.login_count(), 1);
    }

    #[tokio::test]
    async fn unattended_pause_surfaces_manual_intervention() {
        let (market, mut ctx) = setup(SessionSection::default());
        ctx.operator = Arc::new(UnattendedOperatorGate);
        market.configure(|faults| faults.challenge_on_login = true);
        let manager = SessionManager::new(0, ctx);
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, BrowserError::ManualIntervention(_)));
    }

    #[tokio::test]
    async fn lease_recovery_renews_the_session_it_handed_out() {
        let (market, ctx) = setup(SessionSection::default());
        let pool = SessionPool::new(ctx);
        let lease = pool.checkout().await.unwrap();
        let first = lease.session().await.unwrap();
        market.expire_sessions();
        lease.recover().await.unwrap();
        assert_eq!(market.login_count(), 2);
        assert_eq!(lease.session().await.unwrap().generation(), first.generation() + 1);
    }

    #[tokio::test]
    async fn lease_recovery_after_a_newer_login_does_not_log_in_again() {
        let (market, ctx) = setup(SessionSection::default());
        let pool = SessionPool::new(ctx);
        let lease = pool.checkout().await.unwrap();
        let failed_on = lease.session().await.unwrap();
        market.expire_sessions();
        let renewed = pool.primary().acquire().await.unwrap();
        assert_eq!(renewed.generation(), failed_on.generation() + 1);

        lease.recover().await.unwrap();
        assert_eq!(market.login_count(), 2);
        assert_eq!(lease.session().await.unwrap().generation(), renewed.generation());
    }

    #[tokio::test]
    async fn per_worker_pool_leases_distinct_managers() {
        let (_market, ctx) = setup(SessionSection {
            mode: SessionMode::PerWorker,
            workers: 2,
            ..SessionSection::default()
        });
        let pool = SessionPool::new(ctx);
        assert_eq!(pool.concurrency(), 2);
        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        assert_ne!(a.slot(), b.slot());
        drop(a);
        let c = pool.checkout().await.unwrap();
        assert_ne!(c.slot(), b.slot());
    }

    #[tokio::test]
    async fn shared_pool_has_one_manager() {
        let (_market, ctx) = setup(SessionSection {
            workers: 4,
            ..SessionSection::default()
        });
        let pool = SessionPool::new(ctx);
        assert_eq!(pool.concurrency(), 1);
        let lease = pool.checkout().await.unwrap();
        lease.session().await.unwrap();
        drop(lease);
        pool.shutdown().await;
    }
}
