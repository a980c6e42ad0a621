//! Bounded polling and retry
//!
//! Two helpers live here:
//! - [`BoundedPoll`] is the one place that decides how often and how long the
//!   flasher waits for hardware. Mode detection, reconnection and the key write
//!   all run through it with their own interval and attempt bound.
//! - [`retry_with_backoff`] retries transient network failures with exponential
//!   backoff and optional jitter.
//!
//! # Example
//!
//! ```no_run
//! use device_flasher::retry::BoundedPoll;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> device_flasher::Result<()> {
//! let poll = BoundedPoll::new(Duration::from_millis(500), 10);
//! let found = poll
//!     .poll(&CancellationToken::new(), |tick| async move {
//!         (tick == 3).then_some("device")
//!     })
//!     .await?;
//! assert_eq!(found, Some("device"));
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, Result, TransportError};
use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, a device that dropped a command) should return `true`.
/// Permanent failures (validation, unsupported operations, user decisions) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransportError {
    fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Unsupported(_))
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Transport(e) => e.is_retryable(),
            // Everything else is a decision, a validation result or already a final verdict
            _ => false,
        }
    }
}

/// Fixed-interval, fixed-bound waiting for hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedPoll {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum number of attempts (at least one attempt is always made)
    pub max_attempts: u32,
}

impl BoundedPoll {
    /// Create a poll with the given spacing and bound
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Check, wait, re-check until `probe` yields a value or the bound is reached.
    ///
    /// `probe` receives the 1-based tick number. Returns `Ok(None)` when every tick
    /// came back empty, and [`Error::Cancelled`] if `cancel` fires between ticks.
    pub async fn poll<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut probe: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let attempts = self.max_attempts.max(1);

        for tick in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(found) = probe(tick).await {
                return Ok(Some(found));
            }

            if tick < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        Ok(None)
    }

    /// Run `op` against `target` until it succeeds or the attempt bound is reached.
    ///
    /// Non-retryable errors are returned as-is on the spot. Once attempts run out the
    /// last error is wrapped in [`Error::RetriesExhausted`].
    pub async fn retry<S, T, F>(&self, operation: &str, target: &mut S, mut op: F) -> Result<T>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(target).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation,
                            attempts = attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        error = %e,
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = self.interval.as_millis(),
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(error = %e, operation, attempts = attempt, "retries exhausted");
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure that returns Result<T, E> where E implements IsRetryable
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "network operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                tracing::error!(error = %e, attempts = attempt + 1, "network operation failed");
                return Err(e);
            }
        }
    }
}

/// Jitter is uniformly distributed between 0% and 100% of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn poll_returns_first_hit() {
        let poll = BoundedPoll::new(Duration::from_millis(500), 180);
        let start = tokio::time::Instant::now();

        let found = poll
            .poll(&CancellationToken::new(), |tick| async move { (tick == 4).then_some(tick) })
            .await
            .unwrap();

        assert_eq!(found, Some(4));
        // three waits between four checks
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_bound() {
        let poll = BoundedPoll::new(Duration::from_secs(1), 5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let found: Option<()> = poll
            .poll(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }
            })
            .await
            .unwrap();

        assert!(found.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_when_cancelled_between_ticks() {
        let poll = BoundedPoll::new(Duration::from_secs(1), 100);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<Option<()>> = poll
            .poll(&cancel, |tick| {
                if tick == 3 {
                    trigger.cancel();
                }
                async { None }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_one_transient_failure() {
        let poll = BoundedPoll::new(Duration::from_secs(1), 2);
        let mut failures_left = 1u32;

        let value = poll
            .retry("flaky", &mut failures_left, |left| {
                Box::pin(async move {
                    if *left > 0 {
                        *left -= 1;
                        Err(Error::Transport(TransportError::Timeout(100)))
                    } else {
                        Ok(7)
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(failures_left, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_reports_attempts_and_last_error() {
        let poll = BoundedPoll::new(Duration::from_secs(1), 2);
        let mut calls = 0u32;

        let err = poll
            .retry("write key", &mut calls, |calls| {
                Box::pin(async move {
                    *calls += 1;
                    Err::<(), _>(Error::Transport(TransportError::CommandFailed {
                        command: "flash:avb_custom_key".into(),
                        reason: "FAILWrite failed".into(),
                    }))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 2);
        match err {
            Error::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, Error::Transport(TransportError::CommandFailed { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_does_not_repeat_permanent_errors() {
        let poll = BoundedPoll::new(Duration::from_secs(1), 5);
        let mut calls = 0u32;

        let err = poll
            .retry("unsupported", &mut calls, |calls| {
                Box::pin(async move {
                    *calls += 1;
                    Err::<(), _>(Error::Transport(TransportError::Unsupported("sideload".into())))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Transport(TransportError::Unsupported(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_transient_network_errors() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with_backoff(&config, || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::Transport(TransportError::Disconnected))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn jitter_stays_within_double_delay() {
        let delay = Duration::from_millis(100);
        let jittered = add_jitter(delay);
        assert!(jittered >= delay);
        assert!(jittered <= delay * 2);
    }
}
