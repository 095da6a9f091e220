//! Bounded retry for read-modify-write sequences.
//!
//! A [`RetryPolicy`] is `(interval, max attempts, backoff shape)`; the caller
//! supplies the retry predicate. [`retry_with_cancel`] additionally aborts
//! between attempts when the shutdown signal fires. Every write retried here
//! is idempotent, so an aborted loop never leaves a half-applied mutation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::Cancelled;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait `interval` every time.
    Fixed,
    /// Wait `interval * 2^n`, capped at `max_interval`.
    Exponential { max_interval: Duration },
}

/// Retry budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Budget for optimistic-concurrency conflicts on the resource store:
    /// 50ms apart for up to two seconds.
    pub const CONFLICT: Self = Self::fixed(Duration::from_millis(50), 40);

    #[must_use]
    pub const fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    #[must_use]
    pub const fn exponential(interval: Duration, max_attempts: u32, max_interval: Duration) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: Backoff::Exponential { max_interval },
        }
    }

    /// Fixed-interval policy that keeps trying for roughly `timeout`.
    #[must_use]
    pub fn with_timeout(interval: Duration, timeout: Duration) -> Self {
        let per = interval.as_millis().max(1);
        let attempts = timeout.as_millis().div_ceil(per).max(1);
        Self::fixed(interval, u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// Wait before retry number `retry` (0-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max_interval } => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor).min(max_interval)
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), 4, Duration::from_secs(8))
    }
}

/// Cooperative cancellation handle backed by the operator's shutdown channel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    #[must_use]
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been signalled. Pends forever if the
    /// sender is gone without having signalled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// budget is exhausted. Returns the last error on failure.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, should_retry: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt = attempt.saturating_add(1);
                if attempt >= attempts || !should_retry(&e) {
                    return Err(e);
                }
                let backoff = policy.delay(attempt.saturating_sub(1));
                debug!(
                    attempt,
                    max = attempts,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Like [`retry`], but waits for the backoff OR cancellation, whichever
/// comes first.
///
/// # Errors
///
/// Returns the error of the final attempt, or `E::from(Cancelled)` if the
/// token fired before or between attempts.
pub async fn retry_with_cancel<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display + From<Cancelled>,
{
    let mut cancel = cancel.clone();
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }

    let attempts = policy.attempts();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt = attempt.saturating_add(1);
                if attempt >= attempts || !should_retry(&e) {
                    return Err(e);
                }
                let backoff = policy.delay(attempt.saturating_sub(1));
                debug!(
                    attempt,
                    max = attempts,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "operation failed, retrying"
                );

                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = cancel.cancelled() => return Err(Cancelled.into()),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
        #[error("cancelled")]
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            Self::Cancelled
        }
    }

    const FAST: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(1), 3);

    #[test]
    fn exponential_delay_is_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(1), 10, Duration::from_secs(4));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(9), Duration::from_secs(4));
    }

    #[test]
    fn timeout_policy_counts_attempts() {
        let policy = RetryPolicy::with_timeout(Duration::from_millis(50), Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 40);
        assert_eq!(RetryPolicy::CONFLICT, policy);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<u32, TestError> = retry(&FAST, |_| true, || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(TestError::Transient) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), TestError> = retry(
            &FAST,
            |e| matches!(e, TestError::Transient),
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
        )
        .await;
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), TestError> = retry(&FAST, |_| true, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Transient) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_work() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let token = CancelToken::new(rx);

        let result: Result<(), TestError> =
            retry_with_cancel(&FAST, &token, |_| true, || async { Ok(()) }).await;
        assert!(matches!(result, Err(TestError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let (tx, rx) = watch::channel(false);
        let token = CancelToken::new(rx);
        let slow = RetryPolicy::fixed(Duration::from_secs(3600), 5);

        let handle = tokio::spawn(async move {
            retry_with_cancel::<(), TestError, _, _, _>(&slow, &token, |_| true, || async {
                Err(TestError::Transient)
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TestError::Cancelled)));
    }

    #[tokio::test]
    async fn never_token_does_not_fire() {
        let token = CancelToken::never();
        let result: Result<u8, TestError> =
            retry_with_cancel(&FAST, &token, |_| true, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
