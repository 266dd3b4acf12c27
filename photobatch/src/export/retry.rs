//! Retry policy and timers.
//!
//! Retrying is data plus an injected [`Timer`]: the policy computes delays,
//! the timer sleeps. Tests swap in a recording timer and observe the exact
//! delay sequence without waiting.

use super::error::{ErrorClass, ExportError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default attempts per operation, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default ceiling on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Capped exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retrying.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failure: `base * 2^(failures-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Sleeps on behalf of the retry loop.
pub trait Timer: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real timer backed by `tokio::time::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, ExportError>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-recoverable class, or the
/// policy's attempts are used up.
///
/// Only [`ErrorClass::Recoverable`] errors are retried. Cancellation is
/// checked before every retry and interrupts a pending sleep.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timer: &dyn Timer,
    cancel: &CancellationToken,
    mut op: F,
) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = op(attempt).await;
        let err = match result {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if err.class != ErrorClass::Recoverable || attempt >= max_attempts {
            return Retried {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt);
        debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after recoverable error"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Retried {
                    result: Err(ExportError::cancelled(err.stage)),
                    attempts: attempt,
                };
            }
            _ = timer.sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records requested delays and returns immediately.
    #[derive(Default)]
    pub(crate) struct RecordingTimer {
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingTimer {
        pub(crate) fn delays(&self) -> Vec<Duration> {
            self.delays.lock().clone()
        }
    }

    impl Timer for RecordingTimer {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.delays.lock().push(duration);
            Box::pin(std::future::ready(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTimer;
    use super::*;
    use crate::export::error::ExportStage;
    use proptest::prelude::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }

    async fn fail_then_succeed(k: u32, policy: &RetryPolicy, timer: &RecordingTimer) -> Retried<&'static str> {
        let cancel = CancellationToken::new();
        run_with_retry(policy, timer, &cancel, |attempt| async move {
            if attempt <= k {
                Err(ExportError::recoverable(ExportStage::Write, "busy"))
            } else {
                Ok("done")
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_retries_exactly_k_times_with_increasing_delays() {
        let timer = RecordingTimer::default();
        let retried = fail_then_succeed(3, &policy(5), &timer).await;

        assert_eq!(retried.result.unwrap(), "done");
        assert_eq!(retried.attempts, 4);
        assert_eq!(
            timer.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let timer = RecordingTimer::default();
        let retried = fail_then_succeed(10, &policy(3), &timer).await;

        let err = retried.result.unwrap_err();
        assert_eq!(err.class, ErrorClass::Recoverable);
        assert_eq!(retried.attempts, 3);
        assert_eq!(timer.delays().len(), 2);
    }

    #[tokio::test]
    async fn test_non_recoverable_errors_are_not_retried() {
        let timer = RecordingTimer::default();
        let cancel = CancellationToken::new();
        let retried: Retried<()> = run_with_retry(&policy(5), &timer, &cancel, |_| async {
            Err(ExportError::skip(ExportStage::Load, "missing"))
        })
        .await;

        assert_eq!(retried.attempts, 1);
        assert!(timer.delays().is_empty());
        assert_eq!(retried.result.unwrap_err().class, ErrorClass::Skip);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retried: Retried<()> = run_with_retry(&policy(5), &TokioTimer, &cancel, |_| async {
            Err(ExportError::recoverable(ExportStage::Write, "busy"))
        })
        .await;

        let err = retried.result.unwrap_err();
        assert_eq!(err.message, "cancelled");
        assert_eq!(retried.attempts, 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for(64), Duration::from_millis(250));
    }

    proptest! {
        /// Property: k < max failures are retried exactly k times with strictly increasing delays.
        #[test]
        fn prop_k_failures_then_success(k in 0u32..8) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let timer = RecordingTimer::default();
            let retried = rt.block_on(fail_then_succeed(k, &policy(9), &timer));

            prop_assert!(retried.result.is_ok());
            prop_assert_eq!(retried.attempts, k + 1);
            let delays = timer.delays();
            prop_assert_eq!(delays.len() as u32, k);
            prop_assert!(delays.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
