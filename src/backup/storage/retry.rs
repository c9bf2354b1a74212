use crate::backup::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Retries transient storage failures with exponential backoff. Errors that
/// are not retryable are returned after the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_when(operation, BackupError::is_retryable, f)
            .await
    }

    /// Like `execute`, for operations with their own error type and their
    /// own idea of which failures are worth repeating.
    pub async fn execute_when<F, Fut, T, E, P>(
        &self,
        operation: &str,
        should_retry: P,
        mut f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(result);
                }
                Err(error) if !should_retry(&error) => return Err(error),
                Err(error) if attempt >= self.config.max_attempts.max(1) => {
                    warn!(
                        "{}: all {} attempts exhausted: {}",
                        operation, self.config.max_attempts, error
                    );
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        operation, attempt, error, delay
                    );
                    sleep(delay).await;
                    delay = self.calculate_next_delay(delay);
                }
            }
        }
    }

    fn calculate_next_delay(&self, current_delay: Duration) -> Duration {
        let mut next_delay =
            Duration::from_secs_f64(current_delay.as_secs_f64() * self.config.exponential_base);

        if self.config.jitter {
            let jitter_amount = next_delay.as_secs_f64() * 0.1 * rand::random::<f64>();
            next_delay = Duration::from_secs_f64(next_delay.as_secs_f64() + jitter_amount);
        }

        next_delay.min(self.config.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Classify an unexpected storage failure message as transient.
pub(crate) fn transient(operation: &str, key: &str, error: impl std::fmt::Display) -> BackupError {
    BackupError::transient(format!("{operation} {key}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(fast_config(3));

        let result = policy
            .execute("upload", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(BackupError::transient("connection reset"))
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(fast_config(5));

        let result: Result<()> = policy
            .execute("upload", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackupError::KeyConflict {
                        key: "k".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(BackupError::KeyConflict { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(fast_config(2));

        let result: Result<()> = policy
            .execute("download", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackupError::transient("503"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_predicate_decides_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(fast_config(4));

        let result: std::result::Result<(), String> = policy
            .execute_when(
                "stat",
                |e: &String| e.starts_with("temporary"),
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("temporary: throttled".to_string())
                        } else {
                            Err("permission denied".to_string())
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap_err(), "permission denied");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_calculate_next_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            exponential_base: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        });

        assert_eq!(
            policy.calculate_next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.calculate_next_delay(Duration::from_secs(3)),
            Duration::from_secs(5)
        );
    }
}
