use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::backend::QueueError;

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure (1-based), jittered into `[d/2, d]`.
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let half = full / 2;
        let jitter_ms = full.saturating_sub(half).as_millis() as u64;
        if jitter_ms == 0 {
            return full;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// How an operation reacts to cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelMode {
    /// Drop the in-flight request as soon as the token fires.
    Abort,
    /// Let the in-flight request finish; only further attempts are skipped.
    FinishInFlight,
}

pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mode: CancelMode,
    mut op: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() && (mode == CancelMode::Abort || attempt > 0) {
            return Err(QueueError::Cancelled);
        }
        attempt += 1;

        let res = match mode {
            CancelMode::Abort => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                res = op() => res,
            },
            CancelMode::FinishInFlight => op().await,
        };

        let err = match res {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt < max_attempts => err,
            Err(err) => return Err(err),
        };

        let delay = policy.delay_for(attempt);
        tracing::debug!(attempt, max_attempts, ?delay, error = %err, "transient remote failure, backing off");
        tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        for _ in 0..50 {
            let d1 = policy.delay_for(1);
            assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));
            let d3 = policy.delay_for(3);
            assert!(d3 >= Duration::from_millis(200) && d3 <= Duration::from_millis(400));
            let d9 = policy.delay_for(9);
            assert!(d9 <= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_up_to_the_limit() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res: Result<(), QueueError> =
            with_retry(&RetryPolicy::default(), &cancel, CancelMode::Abort, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QueueError::Transient("timeout".into())) }
            })
            .await;
        assert_eq!(res, Err(QueueError::Transient("timeout".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_a_transient_failure() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res = with_retry(&RetryPolicy::default(), &cancel, CancelMode::Abort, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(QueueError::Transient("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(1));
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res: Result<(), QueueError> =
            with_retry(&RetryPolicy::default(), &cancel, CancelMode::Abort, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QueueError::Unauthorized("bad cookie".into())) }
            })
            .await;
        assert!(matches!(res, Err(QueueError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_mode_skips_work_once_cancelled() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), QueueError> =
            with_retry(&RetryPolicy::default(), &cancel, CancelMode::Abort, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(res, Err(QueueError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_in_flight_does_not_retry_after_cancel() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res: Result<(), QueueError> =
            with_retry(&RetryPolicy::default(), &cancel, CancelMode::FinishInFlight, || {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                async { Err(QueueError::Transient("timeout".into())) }
            })
            .await;
        assert_eq!(res, Err(QueueError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
