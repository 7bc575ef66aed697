//! Exponential / fixed backoff retry for external calls.
//!
//! Adapted from the teacher's `retry_with_backoff`
//! (`examples/clawde-io-apps/daemon/src/retry.rs`): a generic async
//! helper retrying a fallible operation with a configurable delay
//! schedule between attempts. Used by the token-exchange loop (§4.1:
//! up to 20 attempts, 1 s apart — `RetryConfig::fixed`) and the
//! state-directory watcher restart loop (§4.9: up to 5 attempts,
//! exponential 1s/2s/4s/... — `RetryConfig::exponential`).

use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryConfig {
    /// Fixed-interval retry: every attempt waits the same delay.
    /// Matches spec.md §4.1's token-exchange policy (20 attempts, 1s apart).
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff starting at `initial_delay`, doubling each
    /// attempt. Matches spec.md §4.9's watcher restart loop (5 attempts,
    /// 1s/2s/4s/8s/16s).
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(u64::MAX / 2),
            multiplier: 2.0,
        }
    }
}

/// Retry an async operation on the configured schedule.
///
/// Calls `f()` up to `config.max_attempts` times. On failure, sleeps the
/// computed delay before retrying. Returns `Ok(value)` on the first
/// success, or `Err(last_error)` once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    assert!(config.max_attempts > 0, "max_attempts must be at least 1");

    let mut delay = config.initial_delay;
    let mut last_err: Option<E> = None;

    for attempt in 1..=config.max_attempts {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < config.max_attempts {
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis(),
                        err = ?e,
                        "attempt failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
                } else {
                    warn!(attempt, max = config.max_attempts, err = ?e, "all retry attempts exhausted");
                    last_err = Some(e);
                }
            }
        }
    }

    Err(last_err.expect("retry loop ended without setting last_err"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let cfg = RetryConfig::fixed(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, |attempt| {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                if attempt < 3 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_and_returns_last_error() {
        let cfg = RetryConfig::fixed(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), String> = retry_with_backoff(&cfg, |_| {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("permanent error".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exponential_delay_doubles() {
        let cfg = RetryConfig::exponential(3, Duration::from_millis(2));
        assert_eq!(cfg.multiplier, 2.0);
        let start = std::time::Instant::now();
        let _: Result<(), String> = retry_with_backoff(&cfg, |_| async { Err("x".to_string()) }).await;
        // 2ms + 4ms = 6ms minimum between the three attempts.
        assert!(start.elapsed() >= Duration::from_millis(6));
    }
}
