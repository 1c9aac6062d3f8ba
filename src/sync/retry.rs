//! Retry driver: exponential backoff with jitter around any fallible
//! storage operation.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fs::error::StorageError;

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&StorageError) -> bool + Send + Sync>;

/// Retry policy. The default is 3 attempts starting at 1 s, doubling up to
/// 30 s, with ±10% jitter, retrying every error.
#[derive(Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter fraction `j`: each sleep is scaled by `1 + U[-j, +j]`.
    pub jitter: f64,
    /// `None` retries everything.
    pub retryable: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            retryable: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("retryable", &self.retryable.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

/// Run `op` under the retry policy. The first attempt executes
/// immediately; sleeps between attempts race the cancellation token. A
/// non-retryable failure is returned as-is; exhausting the attempt budget
/// returns [`StorageError::RetryExhausted`] wrapping the last failure.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let is_retryable = config.retryable.as_ref().map_or(true, |p| p(&err));
        if !is_retryable {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(StorageError::RetryExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            _ = tokio::time::sleep(apply_jitter(delay, config.jitter)) => {}
        }
        delay = std::cmp::min(config.max_delay, delay.mul_f64(config.multiplier));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry(&quick(3), &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StorageError::Other(anyhow::anyhow!("flaky")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_bound() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(&quick(3), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Other(anyhow::anyhow!("always"))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            StorageError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            retryable: Some(Arc::new(|e| !e.is_not_found())),
            ..quick(5)
        };

        let result: Result<(), _> = retry(&config, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::NotFound("gone".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = RetryConfig {
            initial_delay: Duration::from_secs(3600),
            jitter: 0.0,
            ..quick(5)
        };

        let result: Result<(), _> = retry(&config, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Other(anyhow::anyhow!("fail"))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.1);
            assert!(jittered >= Duration::from_secs(9));
            assert!(jittered <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let config = RetryConfig::default();
        let mut delay = config.initial_delay;
        for _ in 0..10 {
            delay = std::cmp::min(config.max_delay, delay.mul_f64(config.multiplier));
        }
        assert_eq!(delay, config.max_delay);
    }
}
