//! Retry Logic
//!
//! Exponential backoff retry with jitter for renewal exchanges.

use std::future::Future;
use std::time::Duration;

use crate::error::CredentialError;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        DEFAULT_RETRY_CONFIG
    }
}

/// Default retry configuration.
pub const DEFAULT_RETRY_CONFIG: RetryConfig = RetryConfig {
    max_retries: 3,
    initial_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(8),
    multiplier: 2.0,
    jitter: 0.1,
};

/// Applies a [`RetryConfig`] to fallible async operations.
#[derive(Debug, Clone, Default)]
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

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let base = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(retry as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_millis() as f64;
        let jitter_range = base * self.config.jitter;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }

    /// Run `operation`, retrying errors classified as retryable.
    ///
    /// A `retry_after` hint from the server replaces the computed backoff,
    /// capped at `max_delay`.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, CredentialError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CredentialError>>,
    {
        let mut retry = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if !error.is_retryable() || retry >= self.config.max_retries {
                        return Err(error);
                    }

                    let delay = error
                        .retry_after()
                        .map(|hint| hint.min(self.config.max_delay))
                        .unwrap_or_else(|| self.delay_with_jitter(retry));

                    tracing::debug!(
                        retry = retry + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying renewal exchange"
                    );

                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NetworkError, ProviderError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(500));
        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_network_errors_up_to_limit() {
        let policy = fast_policy();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CredentialError::Network(NetworkError::ConnectionReset {
                    message: "reset".to_string(),
                }))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = fast_policy();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(CredentialError::Provider(ProviderError::ServerError {
                        status: 503,
                        message: "unavailable".to_string(),
                    }))
                } else {
                    Ok("token")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let policy = fast_policy();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CredentialError::Provider(ProviderError::InvalidGrant {
                    message: "revoked".to_string(),
                }))
            })
            .await;

        assert!(result.unwrap_err().needs_reauth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
