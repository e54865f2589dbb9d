//! Guard adapters: the two call shapes that splice a breaker into a caller's
//! request path.
//!
//! [`execute`] wraps a synchronous call shape: admit, await, record. For
//! request patterns whose completion is observed elsewhere — an async I/O
//! callback, a timer — [`guard_async`] hands back a [`Permit`] whose `Drop`
//! guarantees `in_flight` is released on every exit path, the same
//! "remain in scope to drive the state machine, dropping releases it" idiom
//! this codebase's half-open semaphore permit already relies on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::breaker::{CircuitBreaker, Outcome};
use crate::error::RejectionError;

/// Error returned by [`execute`]: either the breaker rejected admission, or
/// the wrapped call itself failed.
#[derive(Debug)]
pub enum GuardError<E> {
    /// `before_request` rejected admission; `f` was never called.
    Rejected(RejectionError),
    /// `f` ran and returned this error.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Rejected(e) => write!(f, "{e}"),
            GuardError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::Rejected(e) => Some(e),
            GuardError::Inner(e) => Some(e),
        }
    }
}

/// Runs `f` behind `breaker`: calls `before_request`, and on admission calls
/// `f`, records its outcome, and propagates its result. On rejection, `f` is
/// never invoked.
pub async fn execute<F, Fut, T, E>(
    breaker: &Arc<CircuitBreaker>,
    f: F,
) -> Result<T, GuardError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    breaker.before_request().map_err(GuardError::Rejected)?;
    let result = f().await;
    let outcome = if result.is_ok() {
        Outcome::Success
    } else {
        Outcome::Failure
    };
    breaker.after_request(outcome);
    result.map_err(GuardError::Inner)
}

/// An admitted-but-not-yet-completed request. The caller must call exactly
/// one of [`Permit::success`] or [`Permit::failure`]; dropping the permit
/// without calling either records a failure, since an abandoned permit most
/// often means the caller's own task was cancelled or panicked mid-flight.
#[must_use = "a Permit must be resolved with .success() or .failure(), or it records a failure on drop"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    resolved: bool,
}

impl Permit {
    /// Records the guarded request as successful.
    pub fn success(mut self) {
        self.breaker.after_request(Outcome::Success);
        self.resolved = true;
    }

    /// Records the guarded request as failed.
    pub fn failure(mut self) {
        self.breaker.after_request(Outcome::Failure);
        self.resolved = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                key = self.breaker.key(),
                "guard permit dropped without an explicit outcome; recording as failure"
            );
            self.breaker.after_request(Outcome::Failure);
        }
    }
}

/// Calls `before_request` and, on admission, hands back a [`Permit`] that
/// guarantees `in_flight` is released exactly once regardless of how the
/// caller's own task exits.
pub fn guard_async(breaker: &Arc<CircuitBreaker>) -> Result<Permit, RejectionError> {
    breaker.before_request()?;
    Ok(Permit {
        breaker: breaker.clone(),
        resolved: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::Config;
    use crate::metrics::NoopMetricsSink;

    fn breaker() -> Arc<CircuitBreaker> {
        CircuitBreaker::with_metrics("dep", Config::default(), Arc::new(NoopMetricsSink))
    }

    #[tokio::test]
    async fn execute_records_success() {
        let cb = breaker();
        let result: Result<i32, &'static str> = execute(&cb, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.stats().total_successes, 1);
        assert_eq!(cb.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn execute_records_failure() {
        let cb = breaker();
        let result: Result<i32, &'static str> = execute(&cb, || async { Err("boom") }).await;
        assert!(matches!(result, Err(GuardError::Inner("boom"))));
        assert_eq!(cb.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn execute_never_calls_f_when_rejected() {
        let cb = breaker();
        cb.force_open();
        let mut called = false;
        let result: Result<i32, &'static str> = execute(&cb, || async {
            called = true;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(GuardError::Rejected(RejectionError::CircuitOpen))));
        assert!(!called);
    }

    #[tokio::test]
    async fn permit_success_releases_in_flight() {
        let cb = breaker();
        let permit = guard_async(&cb).unwrap();
        assert_eq!(cb.stats().in_flight, 1);
        permit.success();
        assert_eq!(cb.stats().in_flight, 0);
        assert_eq!(cb.stats().total_successes, 1);
    }

    #[tokio::test]
    async fn permit_dropped_without_resolution_records_failure() {
        let cb = breaker();
        {
            let _permit = guard_async(&cb).unwrap();
        }
        assert_eq!(cb.stats().in_flight, 0);
        assert_eq!(cb.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn guard_async_rejects_when_capacity_exceeded() {
        let cb = CircuitBreaker::with_metrics(
            "dep",
            Config {
                max_concurrent: 1,
                ..Config::default()
            },
            Arc::new(NoopMetricsSink),
        );
        let permit = guard_async(&cb).unwrap();
        let err = guard_async(&cb).unwrap_err();
        assert_eq!(err, RejectionError::CapacityExceeded);
        permit.success();
    }
}
