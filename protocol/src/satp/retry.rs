//! Retry and timeout discipline for client-side protocol steps.
//!
//! A transfer gets one wall-clock budget (`max_timeout`) and one retry
//! allowance (`max_retries`) shared by all of its steps. Each attempt is
//! bounded by `min(attempt_timeout, remaining budget)`; retries back off
//! exponentially, never sleeping past the end of the budget.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use super::SatpError;
use crate::config::{SessionPolicy, MIN_ATTEMPT_TIMEOUT};
use crate::monitor::GatewayMonitor;
use crate::session::{Role, SharedSession};

#[derive(Debug, Clone)]
pub struct RetryBudget {
    started: Instant,
    max_retries: u32,
    max_timeout: Duration,
    policy: SessionPolicy,
}

impl RetryBudget {
    pub fn new(max_retries: u32, max_timeout: Duration, policy: &SessionPolicy) -> Self {
        Self {
            started: Instant::now(),
            max_retries,
            max_timeout,
            policy: policy.clone(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn remaining(&self) -> Duration {
        self.max_timeout.saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Timeout for the next attempt: at least `MIN_ATTEMPT_TIMEOUT`, but
    /// never past the end of the budget.
    pub fn attempt_timeout(&self) -> Duration {
        self.policy
            .attempt_timeout()
            .max(MIN_ATTEMPT_TIMEOUT)
            .min(self.remaining())
    }

    /// Pause before retry number `retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.policy.backoff(retry).min(self.remaining())
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// the session's retry budget runs out.
///
/// Every retryable failure bumps the session's `retry_count` for `role`.
/// A session that enters `Recovering` while this loop runs aborts it with
/// [`SatpError::Transact`]; the crash manager owns the session from then on.
pub(crate) async fn with_retries<T, F, Fut>(
    session: &SharedSession,
    role: Role,
    budget: &RetryBudget,
    monitor: &GatewayMonitor,
    step: &str,
    mut attempt: F,
) -> Result<T, SatpError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, SatpError>>,
{
    let session_id = session.lock().id().to_string();
    let mut last_error = SatpError::Timeout(budget.max_timeout.as_millis() as u64);
    loop {
        if session.lock().is_recovering() {
            return Err(SatpError::Transact(format!(
                "session {} under recovery",
                session_id
            )));
        }
        if budget.is_expired() {
            let attempts = session.lock().data(role)?.retry_count;
            return Err(SatpError::RetryExhausted {
                session_id,
                attempts,
                last_error: Box::new(last_error),
            });
        }

        let error = match attempt(budget.attempt_timeout()).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        let retries = {
            let mut guard = session.lock();
            let data = guard.data_mut(role)?;
            data.retry_count += 1;
            data.retry_count
        };
        monitor.retries.inc();

        if retries > budget.max_retries {
            return Err(SatpError::RetryExhausted {
                session_id,
                attempts: retries,
                last_error: Box::new(error),
            });
        }

        let pause = budget.backoff(retries);
        warn!(
            session_id = %session_id,
            step,
            retry = retries,
            max_retries = budget.max_retries,
            "step failed, retrying in {:?}: {}",
            pause,
            error
        );
        last_error = error;
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;
    use crate::session::{Session, SessionParams, SessionState};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn session() -> SharedSession {
        let params = SessionParams::new(
            GatewayKeypair::from_seed(&[1; 32]).public_key(),
            GatewayKeypair::from_seed(&[2; 32]).public_key(),
            "besu",
            "fabric",
        );
        Arc::new(Mutex::new(Session::create("ctx", Role::Client, &params)))
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            max_retries: 3,
            max_timeout_ms: 10_000,
            attempt_timeout_ms: 50,
            retry_backoff_ms: 1,
        }
    }

    #[test]
    fn attempt_timeout_never_exceeds_remaining_budget() {
        let budget = RetryBudget::new(3, Duration::from_millis(20), &policy());
        assert!(budget.attempt_timeout() <= Duration::from_millis(20));
        let expired = RetryBudget::new(3, Duration::ZERO, &policy());
        assert!(expired.is_expired());
        assert_eq!(expired.attempt_timeout(), Duration::ZERO);
        assert_eq!(expired.backoff(1), Duration::ZERO);
    }

    #[test]
    fn minimum_attempt_timeout_is_still_capped_by_the_budget() {
        let mut tiny = policy();
        tiny.attempt_timeout_ms = 0;
        let roomy = RetryBudget::new(3, Duration::from_secs(5), &tiny);
        assert_eq!(roomy.attempt_timeout(), MIN_ATTEMPT_TIMEOUT);

        let nearly_spent = RetryBudget::new(3, Duration::from_millis(2), &tiny);
        assert!(nearly_spent.attempt_timeout() <= Duration::from_millis(2));
        assert!(nearly_spent.attempt_timeout() < MIN_ATTEMPT_TIMEOUT);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let s = session();
        let monitor = GatewayMonitor::new("t").unwrap();
        let budget = RetryBudget::new(3, Duration::from_secs(5), &policy());
        let calls = AtomicU32::new(0);

        let value = with_retries(&s, Role::Client, &budget, &monitor, "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SatpError::Timeout(1))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(s.lock().client_data().unwrap().retry_count, 2);
        assert_eq!(monitor.retries.get(), 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let s = session();
        let monitor = GatewayMonitor::new("t").unwrap();
        let budget = RetryBudget::new(3, Duration::from_secs(5), &policy());
        let calls = AtomicU32::new(0);

        let err = with_retries(&s, Role::Client, &budget, &monitor, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SatpError::Rejected("no".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            SatpError::RetryExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last_error, SatpError::Rejected(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let s = session();
        let monitor = GatewayMonitor::new("t").unwrap();
        let budget = RetryBudget::new(3, Duration::from_secs(5), &policy());
        let err = with_retries(&s, Role::Client, &budget, &monitor, "test", |_| async {
            Err::<(), _>(SatpError::Validation("bad".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SatpError::Validation(_)));
        assert_eq!(s.lock().client_data().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn recovering_session_aborts_loop() {
        let s = session();
        s.lock().set_state(SessionState::Recovering);
        let monitor = GatewayMonitor::new("t").unwrap();
        let budget = RetryBudget::new(3, Duration::from_secs(5), &policy());
        let err = with_retries(&s, Role::Client, &budget, &monitor, "test", |_| async {
            Ok::<_, SatpError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SatpError::Transact(_)));
    }
}
