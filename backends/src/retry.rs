use offsite_core::{Error, ErrorKind};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How long to wait before retry number `attempt` (0-based).
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// `attempt * step`.
    Linear { step: Duration },
    /// `initial * multiplier^attempt`, capped at `max`, optionally with up to 25% jitter.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter: bool,
    },
}

/// Configuration for bounded retry loops
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

impl RetryConfig {
    /// Fragment uploads: 10 attempts, waiting `attempt` seconds between them.
    pub fn fragment() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Linear {
                step: Duration::from_secs(1),
            },
        }
    }

    /// Same attempt budget with no waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => *step * attempt,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let base_ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                let duration_ms = base_ms.min(max.as_millis() as f64) as u64;
                let mut duration = Duration::from_millis(duration_ms);

                if *jitter {
                    let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
                    duration += Duration::from_millis(jitter_ms);
                }

                duration
            }
        }
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. A warning naming the previous error is logged
/// before every retry.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(
                        operation = operation_name,
                        error = %error,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(error);
                }

                if attempt + 1 >= max_attempts {
                    warn!(
                        operation = operation_name,
                        max_attempts,
                        error = %error,
                        "Operation failed after all retry attempts"
                    );
                    return Err(error);
                }

                let backoff = config.backoff_duration(attempt);
                sleep(backoff).await;
                attempt += 1;
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::http(503, "Service Unavailable")
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&RetryConfig::immediate(5), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 { Err(transient()) } else { Ok(42) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&RetryConfig::immediate(3), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Network("connection reset".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&RetryConfig::default(), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Unauthorized("bad token".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_policy_waits_linearly() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(&RetryConfig::fragment(), "fragment", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 9 { Err(transient()) } else { Ok(()) }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        // 0 + 1 + ... + 8 seconds
        assert_eq!(started.elapsed(), Duration::from_secs(36));
    }

    #[test]
    fn test_backoff_duration_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: false,
            },
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(10), Duration::from_secs(10));

        let linear = RetryConfig::fragment();
        assert_eq!(linear.backoff_duration(0), Duration::ZERO);
        assert_eq!(linear.backoff_duration(3), Duration::from_secs(3));
    }
}
