//! Access Facade
//!
//! Entry point for provider adapters: bearer tokens in, cache lifecycle
//! and observability out.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{AccessError, AuthError, CredentialError};
use crate::reconcile::{ReconcileHandle, ReconcileReport, ReconciliationLoop};
use crate::refresh::{RefreshExecutor, TokenRefresher};
use crate::telemetry::{CredentialMetrics, NoOpMetrics};
use crate::token::{CacheStatistics, DurableAdapter, EntryStore, RefreshCoordinator};
use crate::types::{
    AccessToken, CoordinatorConfig, CredentialEntry, CredentialStatus, RefreshedTokens,
};

/// Per-instance view for monitoring. Never carries secrets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceStatistics {
    pub instance_id: String,
    pub owner_id: String,
    pub provider: String,
    pub status: CredentialStatus,
    pub refresh_attempts: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl From<&CredentialEntry> for InstanceStatistics {
    fn from(entry: &CredentialEntry) -> Self {
        Self {
            instance_id: entry.instance_id.clone(),
            owner_id: entry.owner_id.clone(),
            provider: entry.provider.clone(),
            status: entry.status,
            refresh_attempts: entry.refresh_attempts,
            expires_at: entry.expires_at,
            last_used_at: entry.last_used_at,
            last_synced_at: entry.last_synced_at,
            last_refreshed_at: entry.last_refreshed_at,
        }
    }
}

/// Observability surface of the credential cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialStatistics {
    pub cache: CacheStatistics,
    /// Sorted by instance id.
    pub instances: Vec<InstanceStatistics>,
    pub last_reconcile: Option<ReconcileReport>,
}

/// Facade over the coordinator and the reconciliation loop.
///
/// Owns the process-wide credential cache. Create it once with
/// [`AccessFacade::init`] inside a tokio runtime and call
/// [`AccessFacade::shutdown`] before exit.
pub struct AccessFacade<D: DurableAdapter + 'static, R: TokenRefresher = RefreshExecutor> {
    coordinator: Arc<RefreshCoordinator<D, R>>,
    reconciler: Arc<ReconciliationLoop<D>>,
    handle: Mutex<Option<ReconcileHandle>>,
}

impl<D: DurableAdapter + 'static> AccessFacade<D, RefreshExecutor> {
    /// Initialize with the standard renewal chain over HTTP.
    pub async fn init_with_http(
        config: CoordinatorConfig,
        durable: Arc<D>,
    ) -> Result<Self, CredentialError> {
        let executor = RefreshExecutor::from_config(&config)?;
        Ok(Self::init(config, durable, Arc::new(executor)).await)
    }
}

impl<D: DurableAdapter + 'static, R: TokenRefresher> AccessFacade<D, R> {
    /// Wire the components without starting background work.
    pub fn new(
        config: CoordinatorConfig,
        durable: Arc<D>,
        refresher: Arc<R>,
        metrics: Arc<dyn CredentialMetrics>,
    ) -> Self {
        let store = Arc::new(EntryStore::new(config.near_expiry_window));
        let reconcile = config.reconcile.clone();
        let coordinator = Arc::new(
            RefreshCoordinator::new(config, store.clone(), durable.clone(), refresher)
                .with_metrics(metrics.clone()),
        );
        let reconciler = Arc::new(
            ReconciliationLoop::new(reconcile, store, durable, coordinator.locks().clone())
                .with_metrics(metrics),
        );

        Self {
            coordinator,
            reconciler,
            handle: Mutex::new(None),
        }
    }

    /// Wire the components, warm the cache if configured, and start the
    /// reconciliation loop.
    pub async fn init(config: CoordinatorConfig, durable: Arc<D>, refresher: Arc<R>) -> Self {
        Self::init_with_metrics(config, durable, refresher, Arc::new(NoOpMetrics)).await
    }

    /// [`AccessFacade::init`] reporting to the given metrics sink.
    pub async fn init_with_metrics(
        config: CoordinatorConfig,
        durable: Arc<D>,
        refresher: Arc<R>,
        metrics: Arc<dyn CredentialMetrics>,
    ) -> Self {
        let preload = config.preload_on_init;
        let facade = Self::new(config, durable, refresher, metrics);
        if preload {
            facade.preload().await;
        }
        facade.start();
        facade
    }

    /// Start the reconciliation loop if it is not running.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_none() {
            *handle = Some(self.reconciler.clone().spawn());
            tracing::info!("credential reconciliation started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the reconciliation loop.
    pub async fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            tracing::info!("credential reconciliation stopped");
        }
    }

    /// Load every active instance from the durable store. Returns how many
    /// were loaded.
    pub async fn preload(&self) -> usize {
        let ids = match self.coordinator.durable().read_all_active_instance_ids().await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(error = %error, "credential preload failed");
                return 0;
            }
        };

        let concurrency = self.coordinator.config().reconcile.concurrency.max(1);
        let loaded: Vec<bool> = stream::iter(ids)
            .map(|instance_id| async move {
                match self.coordinator.load_instance(&instance_id).await {
                    Ok(_) => true,
                    Err(error) => {
                        tracing::warn!(
                            instance_id = %instance_id,
                            error = %error,
                            "failed to preload instance"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let count = loaded.into_iter().filter(|ok| *ok).count();
        tracing::info!(count, "credential cache preloaded");
        count
    }

    /// Valid bearer token for an instance.
    pub async fn get_bearer_token(&self, instance_id: &str) -> Result<AccessToken, AccessError> {
        self.coordinator
            .ensure_valid_token(instance_id)
            .await
            .map_err(translate)
    }

    /// `Authorization` header value for an instance.
    pub async fn authorization_header(&self, instance_id: &str) -> Result<String, AccessError> {
        let token = self.get_bearer_token(instance_id).await?;
        Ok(token.authorization_header())
    }

    /// Refresh after the provider rejected a token that looked valid.
    pub async fn force_refresh(&self, instance_id: &str) -> Result<AccessToken, AccessError> {
        self.coordinator
            .force_refresh(instance_id)
            .await
            .map_err(translate)
    }

    pub async fn begin_authorization(
        &self,
        instance_id: &str,
        owner_id: &str,
        provider: &str,
    ) -> Result<(), AccessError> {
        self.coordinator
            .begin_authorization(instance_id, owner_id, provider)
            .await
            .map(|_| ())
            .map_err(translate)
    }

    pub async fn complete_authorization(
        &self,
        instance_id: &str,
        tokens: RefreshedTokens,
    ) -> Result<AccessToken, AccessError> {
        self.coordinator
            .complete_authorization(instance_id, tokens)
            .await
            .map_err(translate)
    }

    pub fn invalidate(&self, instance_id: &str) -> bool {
        self.coordinator.invalidate(instance_id)
    }

    /// Run reconciliation immediately.
    pub async fn reconcile_now(&self) -> ReconcileReport {
        self.reconciler.run_once().await
    }

    pub fn statistics(&self) -> CredentialStatistics {
        let store = self.coordinator.store();
        let mut instances: Vec<InstanceStatistics> = store
            .snapshot()
            .iter()
            .map(InstanceStatistics::from)
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        CredentialStatistics {
            cache: store.statistics(),
            instances,
            last_reconcile: self.reconciler.last_report(),
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator<D, R>> {
        &self.coordinator
    }
}

fn translate(error: AuthError) -> AccessError {
    if error.is_retryable() {
        tracing::warn!(
            instance_id = error.instance_id(),
            code = error.error_code(),
            error = %error,
            "credentials temporarily unavailable"
        );
    } else {
        tracing::debug!(
            instance_id = error.instance_id(),
            code = error.error_code(),
            "credential request failed"
        );
    }
    AccessError::from(error)
}
