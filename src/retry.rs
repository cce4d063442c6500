//! Retry guard with randomized jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How many times to attempt a block, and how long to wait before each try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    attempts: u32,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl RetryPolicy {
    /// `attempts` tries with no delay between them.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    /// Sleeps a whole number of seconds in `min..=max` before every attempt.
    pub fn with_jitter_secs(mut self, min: u64, max: u64) -> Self {
        self.jitter_min = Duration::from_secs(min.min(max));
        self.jitter_max = Duration::from_secs(max.max(min));
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Picks the delay for the next attempt.
    pub fn jitter_delay(&self) -> Duration {
        let min = self.jitter_min.as_secs();
        let max = self.jitter_max.as_secs();
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3).with_jitter_secs(1, 15)
    }
}

/// Runs `work` until it succeeds or the policy's attempts are used up.
///
/// `work` receives the 1-based attempt number. When every attempt fails the
/// last fault is returned inside [`Error::RetryExhausted`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut work: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;

    for attempt in 1..=policy.attempts {
        let delay = policy.jitter_delay();
        if !delay.is_zero() {
            tracing::info!(label, attempt, delay_secs = delay.as_secs(), "jitter before attempt");
            tokio::time::sleep(delay).await;
        }

        match work(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!(label, attempt, max = policy.attempts, error = %e, "attempt failed");
                last = Some(e);
            }
        }
    }

    match last {
        Some(e) => Err(Error::RetryExhausted {
            label: label.to_string(),
            attempts: policy.attempts,
            last: Box::new(e),
        }),
        None => Err(Error::Config(format!(
            "retry policy for {} allows no attempts",
            label
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32, calls: &AtomicU32) -> impl Future<Output = Result<u32>> + '_ {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= failures {
                Err(Error::Command {
                    program: "kitchen".to_string(),
                    code: Some(1),
                    stderr: format!("attempt {}", n),
                })
            } else {
                Ok(n)
            }
        }
    }

    #[test]
    fn default_policy_is_three_attempts_with_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        for _ in 0..50 {
            let d = policy.jitter_delay();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(15));
        }
    }

    #[test]
    fn inverted_jitter_bounds_are_normalized() {
        let policy = RetryPolicy::new(1).with_jitter_secs(5, 2);
        let d = policy.jitter_delay();
        assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let value = retry(&RetryPolicy::new(3), "create-vm", |_| flaky(0, &calls))
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let value = retry(&RetryPolicy::new(3), "create-vm", |_| flaky(2, &calls))
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn three_failures_propagate_last_fault() {
        let calls = AtomicU32::new(0);
        let err = retry(&RetryPolicy::new(3), "create-vm", |_| flaky(3, &calls))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("attempt 3"));
            }
            other => panic!("expected exhausted retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn zero_attempts_is_a_config_error() {
        let calls = AtomicU32::new(0);
        let err = retry(&RetryPolicy::new(0), "create-vm", |_| flaky(0, &calls))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_sleeps_before_every_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3).with_jitter_secs(10, 10);
        let start = tokio::time::Instant::now();

        retry(&policy, "create-vm", |_| flaky(2, &calls)).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }
}
