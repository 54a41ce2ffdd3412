//! Refresh Executor
//!
//! Runs the ordered renewal strategies and classifies the outcome once.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::core::{HttpTransport, ReqwestHttpTransport, DEFAULT_MAX_RESPONSE_SIZE};
use crate::error::{CredentialError, FailureClass, RefreshError};
use crate::refresh::strategy::{
    DirectProviderStrategy, PrimaryRenewalStrategy, RefreshRequest, RenewalStrategy,
};
use crate::resilience::{RetryConfig, RetryPolicy};
use crate::telemetry::{CredentialMetrics, NoOpMetrics};
use crate::types::{CoordinatorConfig, RefreshedTokens};

/// Produces fresh tokens for an instance.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Refresh tokens, classifying any failure as terminal or transient.
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshedTokens, RefreshError>;
}

/// Executes the renewal chain.
///
/// A protocol rejection from any strategy stops the chain. A strategy that
/// is exhausted or unreachable hands over to the next one.
pub struct RefreshExecutor {
    strategies: Vec<Arc<dyn RenewalStrategy>>,
    retry: RetryPolicy,
    metrics: Arc<dyn CredentialMetrics>,
}

impl RefreshExecutor {
    /// Create executor over an explicit strategy list.
    pub fn new(strategies: Vec<Arc<dyn RenewalStrategy>>, retry: RetryConfig) -> Self {
        Self {
            strategies,
            retry: RetryPolicy::new(retry),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Standard chain over the reqwest transport.
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self, CredentialError> {
        let transport = Arc::new(ReqwestHttpTransport::with_options(
            config.http_timeout,
            DEFAULT_MAX_RESPONSE_SIZE,
        )?);
        Ok(Self::with_transport(config, transport))
    }

    /// Standard chain: primary service (when configured), then the provider.
    pub fn with_transport<T: HttpTransport + 'static>(
        config: &CoordinatorConfig,
        transport: Arc<T>,
    ) -> Self {
        let mut strategies: Vec<Arc<dyn RenewalStrategy>> = Vec::new();
        if let Some(service) = &config.renewal_service {
            strategies.push(Arc::new(PrimaryRenewalStrategy::new(
                service.clone(),
                transport.clone(),
                config.http_timeout,
            )));
        }
        strategies.push(Arc::new(DirectProviderStrategy::new(
            transport,
            config.http_timeout,
        )));
        Self::new(strategies, config.retry.clone())
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CredentialMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Strategy names in execution order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenRefresher for RefreshExecutor {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshedTokens, RefreshError> {
        let mut attempted = false;
        let mut last_failure: Option<(String, Option<Duration>)> = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            if !strategy.applies_to(request) {
                tracing::debug!(
                    instance_id = %request.instance_id,
                    strategy = name,
                    "renewal strategy not applicable"
                );
                continue;
            }
            attempted = true;

            match self.retry.execute(|| strategy.exchange(request)).await {
                Ok(tokens) => {
                    self.metrics.record_refresh(&request.provider, name, "success");
                    return Ok(tokens);
                }
                Err(error) => match error.classify() {
                    FailureClass::Terminal => {
                        self.metrics.record_refresh(&request.provider, name, "rejected");
                        tracing::warn!(
                            instance_id = %request.instance_id,
                            provider = %request.provider,
                            strategy = name,
                            error = %error,
                            "renewal rejected"
                        );
                        return Err(RefreshError::RequiresReauth {
                            strategy: Some(name.to_string()),
                            reason: error.to_string(),
                        });
                    }
                    FailureClass::Retryable | FailureClass::Exhausted => {
                        self.metrics.record_refresh(&request.provider, name, "exhausted");
                        tracing::warn!(
                            instance_id = %request.instance_id,
                            provider = %request.provider,
                            strategy = name,
                            error = %error,
                            "renewal strategy exhausted"
                        );
                        last_failure = Some((format!("{}: {}", name, error), error.retry_after()));
                    }
                },
            }
        }

        if !attempted {
            return Err(RefreshError::RequiresReauth {
                strategy: None,
                reason: "no renewal path available".to_string(),
            });
        }

        let (reason, retry_after) =
            last_failure.unwrap_or_else(|| ("all renewal strategies failed".to_string(), None));
        Err(RefreshError::TransientFailure {
            reason,
            retry_after,
        })
    }
}

/// Mock refresher for testing.
///
/// Outcomes are returned in the order queued, then the default outcome.
#[derive(Default)]
pub struct MockTokenRefresher {
    outcomes: Mutex<VecDeque<Result<RefreshedTokens, RefreshError>>>,
    default_outcome: Mutex<Option<Result<RefreshedTokens, RefreshError>>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<RefreshRequest>>,
    calls: AtomicUsize,
}

impl MockTokenRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome.
    pub fn queue(&self, outcome: Result<RefreshedTokens, RefreshError>) -> &Self {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    /// Outcome returned once the queue is empty.
    pub fn set_default(&self, outcome: Result<RefreshedTokens, RefreshError>) -> &Self {
        *self
            .default_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self
    }

    /// Sleep before answering each call.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    /// Number of refresh calls made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn get_requests(&self) -> Vec<RefreshRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenRefresher for MockTokenRefresher {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshedTokens, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match queued {
            Some(outcome) => outcome,
            None => self
                .default_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_else(|| {
                    Err(RefreshError::TransientFailure {
                        reason: "no mock outcome configured".to_string(),
                        retry_after: None,
                    })
                }),
        }
    }
}
