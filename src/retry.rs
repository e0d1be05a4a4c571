use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many times an operation is attempted and how long to wait in between.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    #[serde(with = "crate::config::duration")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Delays between attempts; one fewer than the number of attempts.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        FixedInterval::new(self.delay).take(self.attempts.saturating_sub(1))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Cancellation was observed before an attempt or during a delay. Carries
    /// the error of the last attempt, if one ran.
    Cancelled(Option<E>),
    /// Every attempt failed; carries the last error.
    Exhausted(E),
}

/// Runs `action` until it succeeds, the policy is used up, or `cancel` fires.
///
/// Cancellation is checked before each attempt and cuts a delay short; an
/// attempt that has started is never interrupted.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut action: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut delays = policy.strategy();
    let mut last = None;
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled(last));
        }

        let err = match action().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        debug!("Retry: attempt {attempt}/{attempts} failed: {err}");

        let Some(delay) = delays.next() else {
            return Err(RetryError::Exhausted(err));
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled(Some(err))),
            _ = tokio::time::sleep(delay) => {}
        }
        last = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;

    use super::*;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1));

    #[test]
    fn strategy_length() {
        assert_eq!(FAST.strategy().count(), 2);
        assert_eq!(RetryPolicy::new(1, Duration::ZERO).strategy().count(), 0);
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).strategy().count(), 0);
    }

    #[test(tokio::test)]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result = retry(FAST, &cancel, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("boom")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn exhausted_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(FAST, &cancel, || {
            let calls = calls.clone();
            async move { Err(format!("failure {}", calls.fetch_add(1, Ordering::SeqCst))) }
        })
        .await;

        assert_eq!(result, Err(RetryError::Exhausted("failure 2".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<&str>> = retry(FAST, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result, Err(RetryError::Cancelled(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn cancellation_stops_further_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = retry(FAST, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            async { Err("boom") }
        })
        .await;

        assert_eq!(result, Err(RetryError::Cancelled(Some("boom"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancellation_cuts_the_delay_short() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let slow = RetryPolicy::new(3, Duration::from_secs(60));
        let result: Result<(), _> = retry(slow, &cancel, || async { Err("boom") }).await;

        assert_eq!(result, Err(RetryError::Cancelled(Some("boom"))));
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
