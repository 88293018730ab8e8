use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    aws::{CredentialStore, Token},
    constants::{RENEWAL_INITIAL_BACKOFF, RENEWAL_MAX_ATTEMPTS, RENEWAL_MAX_BACKOFF},
    error::{Error, Result},
};

/// Produces a fresh token for the profile being kept alive.
///
/// Implementations must never prompt; they reuse the username, password
/// and role captured at login.
#[async_trait]
pub trait Renewer: Send + Sync {
    async fn renew(&self) -> Result<Token>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RENEWAL_MAX_ATTEMPTS,
            initial_backoff: RENEWAL_INITIAL_BACKOFF,
            max_backoff: RENEWAL_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// A stop was requested and honoured.
    Stopped,
    /// Renewal failed for good; the credential store still holds the last good token.
    Failed(Error),
}

enum Attempt {
    Renewed(Token),
    Stopped,
    Failed(Error),
}

#[derive(Debug, Clone)]
pub struct RenewalScheduler {
    margin: f64,
    interval: Option<Duration>,
    retry: RetryPolicy,
}

impl RenewalScheduler {
    /// `margin` is the fraction of the remaining lifetime to sleep before renewing.
    pub fn new(margin: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&margin) {
            return Err(Error::ConfigInvalid(format!(
                "refresh margin must be between 0 and 1, got {margin}"
            )));
        }
        Ok(Self {
            margin,
            interval: None,
            retry: RetryPolicy::default(),
        })
    }

    /// Never sleep longer than `interval` between renewals.
    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval.filter(|i| !i.is_zero());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn sleep_duration(&self, expiration: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let ttl_ms = (expiration - now).num_milliseconds();
        if ttl_ms <= 0 {
            return Duration::ZERO;
        }

        let wait = Duration::from_secs_f64(ttl_ms as f64 / 1000.0 * self.margin);
        match self.interval {
            Some(interval) => wait.min(interval),
            None => wait,
        }
    }

    /// Keep `profile` fresh until stopped or until renewal fails for good.
    ///
    /// A stop request interrupts sleeps and backoff waits; an in-flight
    /// renewal is allowed to finish and its token is written before exiting.
    pub async fn run<R, F>(
        &self,
        renewer: &R,
        store: &CredentialStore,
        profile: &str,
        mut expiration: DateTime<Utc>,
        shutdown: &mut watch::Receiver<bool>,
        mut on_renewed: F,
    ) -> RunOutcome
    where
        R: Renewer + ?Sized,
        F: FnMut(&Token),
    {
        loop {
            let wait = self.sleep_duration(expiration, Utc::now());
            info!(
                profile,
                seconds = wait.as_secs(),
                %expiration,
                "Going to sleep before renewing credentials"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_requested(shutdown) => return RunOutcome::Stopped,
            }

            let token = match self.renew_with_retry(renewer, shutdown).await {
                Attempt::Renewed(token) => token,
                Attempt::Stopped => return RunOutcome::Stopped,
                Attempt::Failed(e) => {
                    warn!(profile, error = %e, "Giving up on credential renewal");
                    return RunOutcome::Failed(e);
                }
            };

            if let Err(e) = store.save(profile, &token) {
                return RunOutcome::Failed(e);
            }
            info!(profile, expiration = %token.expiration, "Renewed credentials");
            expiration = token.expiration;
            on_renewed(&token);

            if *shutdown.borrow() {
                return RunOutcome::Stopped;
            }
        }
    }

    async fn renew_with_retry<R>(
        &self,
        renewer: &R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Attempt
    where
        R: Renewer + ?Sized,
    {
        let mut attempt = 1;
        loop {
            match renewer.renew().await {
                Ok(token) => return Attempt::Renewed(token),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        retry_in = delay.as_secs(),
                        error = %e,
                        "Renewal attempt failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_requested(shutdown) => return Attempt::Stopped,
                    }
                    attempt += 1;
                }
                Err(e) => return Attempt::Failed(e),
            }
        }
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender also counts as a stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };
    use tempfile::TempDir;

    fn token(key: &str, ttl_secs: i64) -> Token {
        Token {
            access_key_id: key.to_string(),
            secret_access_key: format!("{key}-secret"),
            session_token: format!("{key}-session"),
            expiration: Utc::now() + TimeDelta::seconds(ttl_secs),
        }
    }

    struct ScriptedRenewer {
        results: Mutex<VecDeque<Result<Token>>>,
        calls: AtomicU32,
        stop_after: Option<(u32, watch::Sender<bool>)>,
    }

    impl ScriptedRenewer {
        fn new(results: Vec<Result<Token>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
                stop_after: None,
            }
        }

        fn stopping_after(mut self, calls: u32, tx: watch::Sender<bool>) -> Self {
            self.stop_after = Some((calls, tx));
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Renewer for ScriptedRenewer {
        async fn renew(&self) -> Result<Token> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, tx)) = &self.stop_after {
                if calls >= *after {
                    tx.send_replace(true);
                }
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::AuthenticationFailed("script exhausted".into())))
        }
    }

    fn store_with_original() -> (TempDir, CredentialStore) {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials"));
        store.save("default", &token("ORIGINAL", 100)).unwrap();
        (dir, store)
    }

    fn stored_key(store: &CredentialStore) -> String {
        store
            .load("default")
            .unwrap()
            .unwrap()
            .access_key_id
    }

    #[test]
    fn test_sleep_is_margin_of_remaining_lifetime() {
        let scheduler = RenewalScheduler::new(0.9).unwrap();
        let now = Utc::now();
        let wait = scheduler.sleep_duration(now + TimeDelta::seconds(100), now);
        assert_eq!(wait, Duration::from_secs(90));
    }

    #[test]
    fn test_expired_token_renews_immediately() {
        let scheduler = RenewalScheduler::new(0.9).unwrap();
        let now = Utc::now();
        let wait = scheduler.sleep_duration(now - TimeDelta::seconds(5), now);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_interval_caps_sleep() {
        let scheduler = RenewalScheduler::new(0.9)
            .unwrap()
            .with_interval(Some(Duration::from_secs(60)));
        let now = Utc::now();
        let wait = scheduler.sleep_duration(now + TimeDelta::seconds(3600), now);
        assert_eq!(wait, Duration::from_secs(60));

        let short = scheduler.sleep_duration(now + TimeDelta::seconds(10), now);
        assert_eq!(short, Duration::from_secs(9));
    }

    #[test]
    fn test_zero_interval_means_margin_only() {
        let scheduler = RenewalScheduler::new(0.5)
            .unwrap()
            .with_interval(Some(Duration::ZERO));
        assert_eq!(scheduler.interval(), None);
    }

    #[test]
    fn test_margin_bounds() {
        assert!(RenewalScheduler::new(0.0).is_ok());
        assert!(RenewalScheduler::new(1.0).is_ok());
        assert!(matches!(
            RenewalScheduler::new(-0.1),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            RenewalScheduler::new(1.5),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(RenewalScheduler::new(f64::NAN).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(30));
        assert_eq!(retry.backoff(2), Duration::from_secs(60));
        assert_eq!(retry.backoff(3), Duration::from_secs(120));
        assert_eq!(retry.backoff(4), Duration::from_secs(240));
        assert_eq!(retry.backoff(5), Duration::from_secs(300));
        assert_eq!(retry.backoff(40), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_and_writes_store_until_stopped() {
        let (_dir, store) = store_with_original();
        let (tx, mut rx) = watch::channel(false);
        let renewer = ScriptedRenewer::new(vec![Ok(token("FIRST", 100)), Ok(token("SECOND", 100))])
            .stopping_after(2, tx);
        let scheduler = RenewalScheduler::new(0.9).unwrap();

        let mut renewed = Vec::new();
        let started = tokio::time::Instant::now();
        let outcome = scheduler
            .run(
                &renewer,
                &store,
                "default",
                Utc::now() + TimeDelta::seconds(100),
                &mut rx,
                |t| renewed.push(t.access_key_id.clone()),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(renewer.calls(), 2);
        assert_eq!(renewed, vec!["FIRST", "SECOND"]);
        assert_eq!(stored_key(&store), "SECOND");
        assert!(started.elapsed() >= Duration::from_secs(170));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let (_dir, store) = store_with_original();
        let (tx, mut rx) = watch::channel(false);
        let renewer = ScriptedRenewer::new(vec![]);
        let scheduler = RenewalScheduler::new(0.9).unwrap();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send_replace(true);
            tx
        });

        let outcome = scheduler
            .run(
                &renewer,
                &store,
                "default",
                Utc::now() + TimeDelta::seconds(3600),
                &mut rx,
                |_| {},
            )
            .await;
        let _tx = stopper.await.unwrap();

        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(renewer.calls(), 0);
        assert_eq!(stored_key(&store), "ORIGINAL");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries_and_keep_store() {
        let (_dir, store) = store_with_original();
        let (_tx, mut rx) = watch::channel(false);
        let failures = (0..RENEWAL_MAX_ATTEMPTS)
            .map(|_| Err(Error::Transport("connection refused".into())))
            .collect();
        let renewer = ScriptedRenewer::new(failures);
        let scheduler = RenewalScheduler::new(0.9).unwrap();

        let outcome = scheduler
            .run(
                &renewer,
                &store,
                "default",
                Utc::now() - TimeDelta::seconds(1),
                &mut rx,
                |_| {},
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Failed(Error::Transport(_))));
        assert_eq!(renewer.calls(), RENEWAL_MAX_ATTEMPTS);
        assert_eq!(stored_key(&store), "ORIGINAL");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let (_dir, store) = store_with_original();
        let (tx, mut rx) = watch::channel(false);
        let renewer = ScriptedRenewer::new(vec![
            Err(Error::Transport("timeout".into())),
            Ok(token("RECOVERED", 100)),
        ])
        .stopping_after(2, tx);
        let scheduler = RenewalScheduler::new(0.9).unwrap();

        let outcome = scheduler
            .run(
                &renewer,
                &store,
                "default",
                Utc::now(),
                &mut rx,
                |_| {},
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(stored_key(&store), "RECOVERED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let (_dir, store) = store_with_original();
        let (_tx, mut rx) = watch::channel(false);
        let renewer = ScriptedRenewer::new(vec![Err(Error::AuthenticationFailed(
            "password expired".into(),
        ))]);
        let scheduler = RenewalScheduler::new(0.9).unwrap();

        let outcome = scheduler
            .run(
                &renewer,
                &store,
                "default",
                Utc::now(),
                &mut rx,
                |_| {},
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(Error::AuthenticationFailed(_))
        ));
        assert_eq!(renewer.calls(), 1);
        assert_eq!(stored_key(&store), "ORIGINAL");
    }
}
