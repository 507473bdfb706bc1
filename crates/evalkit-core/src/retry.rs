//! Retry policy and the invoke-with-retry combinator used by inference and judge calls.

use crate::errors::RetryError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Upper bound for a single backoff interval.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay after the failed attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Source of delays between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real delays on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
pub async fn invoke_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt + 1 >= attempts => {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: e,
                })
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    call = label,
                    error = %e,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying call"
                );
                sleeper.sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use std::sync::Mutex;

    /// Records requested delays instead of sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn server_error() -> ProviderError {
        ProviderError::Server {
            status: 502,
            body: "bad gateway".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let out = invoke_with_retry(
            &policy,
            &sleeper,
            "test",
            ProviderError::is_retryable,
            |attempt| async move {
                if attempt < 2 {
                    Err(server_error())
                } else {
                    Ok(attempt)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn exhaustion_is_typed() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let err = invoke_with_retry(
            &policy,
            &sleeper,
            "test",
            ProviderError::is_retryable,
            |_| async { Err::<(), _>(server_error()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 2, .. }));
        assert_eq!(sleeper.delays.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let err = invoke_with_retry(
            &RetryPolicy::default(),
            &sleeper,
            "test",
            ProviderError::is_retryable,
            |_| async {
                Err::<(), _>(ProviderError::Client {
                    status: 400,
                    body: "bad request".into(),
                })
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Fatal(_)));
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }
}
