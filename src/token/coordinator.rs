//! Refresh Coordinator
//!
//! Serves valid access tokens, refreshing at most once per instance at a
//! time and keeping the cache and the durable record in step.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{AuthError, RefreshError, StorageError};
use crate::refresh::{RefreshRequest, TokenRefresher};
use crate::telemetry::{CredentialMetrics, NoOpMetrics};
use crate::token::cache::EntryStore;
use crate::token::durable::DurableAdapter;
use crate::token::locks::InstanceLocks;
use crate::types::entry::to_chrono;
use crate::types::{
    AccessToken, CoordinatorConfig, CredentialEntry, CredentialStatus, EntryUpdate,
    RefreshedTokens, TokenRecord, TokenRecordUpdate, TokenUpdate,
};

#[derive(Clone, Copy, Debug)]
enum RefreshMode {
    /// Refresh only if the cached token is not usable.
    IfStale,
    /// Refresh unless someone else refreshed after `requested_at`.
    Force { requested_at: DateTime<Utc> },
}

/// Per-instance refresh coordinator.
pub struct RefreshCoordinator<D: DurableAdapter, R: TokenRefresher> {
    config: CoordinatorConfig,
    store: Arc<EntryStore>,
    durable: Arc<D>,
    refresher: Arc<R>,
    locks: Arc<InstanceLocks>,
    metrics: Arc<dyn CredentialMetrics>,
}

impl<D: DurableAdapter, R: TokenRefresher> RefreshCoordinator<D, R> {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<EntryStore>,
        durable: Arc<D>,
        refresher: Arc<R>,
    ) -> Self {
        Self {
            config,
            store,
            durable,
            refresher,
            locks: Arc::new(InstanceLocks::new()),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CredentialMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }

    pub fn locks(&self) -> &Arc<InstanceLocks> {
        &self.locks
    }

    pub fn metrics(&self) -> &Arc<dyn CredentialMetrics> {
        &self.metrics
    }

    /// Return a usable access token, refreshing it first if needed.
    pub async fn ensure_valid_token(&self, instance_id: &str) -> Result<AccessToken, AuthError> {
        let entry = match self.store.get(instance_id) {
            Some(entry) => entry,
            None => {
                tracing::debug!(instance_id, "credential cache miss");
                self.load_instance(instance_id).await?
            }
        };

        if entry.is_usable(self.config.safety_buffer) {
            if let Some(token) = entry.access_token() {
                self.metrics.record_cache_lookup(&entry.provider, true);
                tracing::debug!(instance_id, provider = %entry.provider, "credential cache hit");
                return Ok(token);
            }
        }

        self.metrics.record_cache_lookup(&entry.provider, false);
        self.refresh_locked(instance_id, RefreshMode::IfStale).await
    }

    /// Refresh even though the cached token looks valid.
    ///
    /// Used when the provider rejected a token before its recorded expiry.
    /// Callers that queued behind a concurrent refresh get its result.
    pub async fn force_refresh(&self, instance_id: &str) -> Result<AccessToken, AuthError> {
        let requested_at = Utc::now();
        if self.store.peek(instance_id).is_none() {
            self.load_instance(instance_id).await?;
        }
        self.refresh_locked(instance_id, RefreshMode::Force { requested_at })
            .await
    }

    /// Load an instance from the durable store into the cache.
    ///
    /// An entry cached concurrently is kept in preference to the record.
    pub async fn load_instance(&self, instance_id: &str) -> Result<CredentialEntry, AuthError> {
        let record = self
            .durable
            .read_token_record(instance_id)
            .await
            .map_err(|source| AuthError::DurableStore {
                instance_id: instance_id.to_string(),
                source,
            })?
            .ok_or_else(|| AuthError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        let entry = CredentialEntry::from_record(instance_id, &record);
        Ok(self.store.put_if_absent(instance_id, entry))
    }

    /// Drop the cached entry; the next access reloads it.
    pub fn invalidate(&self, instance_id: &str) -> bool {
        let removed = self.store.remove(instance_id);
        if removed {
            self.locks.release_if_idle(instance_id);
            tracing::debug!(instance_id, "credential entry invalidated");
        }
        removed
    }

    // Slots of uncached instances are otherwise never visited by reconciliation.
    fn release_if_uncached(&self, instance_id: &str) {
        if self.store.peek(instance_id).is_none() {
            self.locks.release_if_idle(instance_id);
        }
    }

    /// Start authorization for an instance.
    ///
    /// Creates a pending record, or resets an existing one to pending when
    /// the user is re-authorizing.
    pub async fn begin_authorization(
        &self,
        instance_id: &str,
        owner_id: &str,
        provider: &str,
    ) -> Result<CredentialEntry, AuthError> {
        let slot = self.locks.slot(instance_id);
        let result = {
            let _guard = slot.lock().await;
            self.reset_to_pending(instance_id, owner_id, provider).await
        };
        drop(slot);
        self.release_if_uncached(instance_id);
        result
    }

    async fn reset_to_pending(
        &self,
        instance_id: &str,
        owner_id: &str,
        provider: &str,
    ) -> Result<CredentialEntry, AuthError> {
        let durable_err = |source: StorageError| AuthError::DurableStore {
            instance_id: instance_id.to_string(),
            source,
        };

        let created = self
            .durable
            .create_token_record(instance_id, TokenRecord::pending(owner_id, provider))
            .await;

        let entry = match created {
            Ok(()) => CredentialEntry::pending(instance_id, owner_id, provider),
            Err(StorageError::RecordExists { .. }) => {
                self.durable
                    .write_token_record(
                        instance_id,
                        TokenRecordUpdate::cleared(CredentialStatus::Pending, Vec::new()),
                    )
                    .await
                    .map_err(durable_err)?;
                match self
                    .durable
                    .read_token_record(instance_id)
                    .await
                    .map_err(durable_err)?
                {
                    Some(record) => CredentialEntry::from_record(instance_id, &record),
                    None => CredentialEntry::pending(instance_id, owner_id, provider),
                }
            }
            Err(source) => return Err(durable_err(source)),
        };

        self.store.put(instance_id, entry);
        tracing::info!(instance_id, provider, "authorization started");
        self.store
            .peek(instance_id)
            .ok_or_else(|| AuthError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Store the tokens from the initial authorization-code exchange.
    pub async fn complete_authorization(
        &self,
        instance_id: &str,
        tokens: RefreshedTokens,
    ) -> Result<AccessToken, AuthError> {
        if self.store.peek(instance_id).is_none() {
            self.load_instance(instance_id).await?;
        }

        let slot = self.locks.slot(instance_id);
        let result = {
            let _guard = slot.lock().await;
            self.store_authorized_tokens(instance_id, tokens).await
        };
        drop(slot);
        self.release_if_uncached(instance_id);
        result
    }

    async fn store_authorized_tokens(
        &self,
        instance_id: &str,
        tokens: RefreshedTokens,
    ) -> Result<AccessToken, AuthError> {
        let entry = match self.store.peek(instance_id) {
            Some(entry) => entry,
            None => self.load_instance(instance_id).await?,
        };
        let token = self.store_tokens(&entry, tokens, false).await?;
        tracing::info!(instance_id, provider = %entry.provider, "authorization completed");
        Ok(token)
    }

    async fn refresh_locked(
        &self,
        instance_id: &str,
        mode: RefreshMode,
    ) -> Result<AccessToken, AuthError> {
        let slot = self.locks.slot(instance_id);
        let result = {
            let _guard = slot.lock().await;
            self.refresh_with_lock(instance_id, mode).await
        };
        drop(slot);
        self.release_if_uncached(instance_id);
        result
    }

    async fn refresh_with_lock(
        &self,
        instance_id: &str,
        mode: RefreshMode,
    ) -> Result<AccessToken, AuthError> {
        let entry = match self.store.peek(instance_id) {
            Some(entry) => entry,
            None => self.load_instance(instance_id).await?,
        };

        if entry.is_usable(self.config.safety_buffer) {
            let refreshed_meanwhile = match mode {
                RefreshMode::IfStale => true,
                RefreshMode::Force { requested_at } => entry
                    .last_refreshed_at
                    .map(|at| at > requested_at)
                    .unwrap_or(false),
            };
            if refreshed_meanwhile {
                if let Some(token) = entry.access_token() {
                    return Ok(token);
                }
            }
        }

        match entry.status {
            CredentialStatus::Pending => {
                return Err(AuthError::AuthorizationPending {
                    instance_id: instance_id.to_string(),
                })
            }
            CredentialStatus::RequiresReauth => {
                return Err(AuthError::ReauthRequired {
                    instance_id: instance_id.to_string(),
                    reason: "credentials must be re-authorized".to_string(),
                })
            }
            _ => {}
        }

        if entry.refresh_attempts >= self.config.max_refresh_attempts {
            self.mark_reauth(&entry, "attempt_ceiling").await;
            return Err(AuthError::AttemptCeilingExceeded {
                instance_id: instance_id.to_string(),
                attempts: entry.refresh_attempts,
            });
        }

        self.run_refresh(entry).await
    }

    /// Refresh with the lock held.
    async fn run_refresh(&self, entry: CredentialEntry) -> Result<AccessToken, AuthError> {
        let instance_id = entry.instance_id.as_str();
        let previous_status = entry.status;
        self.store.update_metadata(
            instance_id,
            EntryUpdate::new().status(CredentialStatus::Refreshing),
        );

        tracing::debug!(
            instance_id,
            provider = %entry.provider,
            attempt = entry.refresh_attempts + 1,
            "refreshing access token"
        );

        let request = RefreshRequest::from(&entry);
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.config.refresh_timeout, self.refresher.refresh(&request))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(RefreshError::TransientFailure {
                    reason: format!(
                        "refresh did not finish within {:?}",
                        self.config.refresh_timeout
                    ),
                    retry_after: None,
                }),
            };
        self.metrics.record_refresh_duration(
            &entry.provider,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        match outcome {
            Ok(tokens) => {
                let strategy = tokens.strategy;
                match self.store_tokens(&entry, tokens, true).await {
                    Ok(token) => {
                        tracing::info!(
                            instance_id,
                            provider = %entry.provider,
                            strategy,
                            "access token refreshed"
                        );
                        Ok(token)
                    }
                    Err(error) => {
                        if !matches!(error, AuthError::InstanceNotFound { .. }) {
                            self.store.update_metadata(
                                instance_id,
                                EntryUpdate::new().status(previous_status),
                            );
                        }
                        Err(error)
                    }
                }
            }
            Err(RefreshError::TransientFailure {
                reason,
                retry_after,
            }) => self.record_transient_failure(&entry, reason, retry_after).await,
            Err(RefreshError::RequiresReauth { strategy, reason }) => {
                tracing::error!(
                    instance_id,
                    provider = %entry.provider,
                    strategy = strategy.as_deref().unwrap_or("none"),
                    reason = %reason,
                    "refresh rejected, re-authorization required"
                );
                self.mark_reauth(&entry, "rejected").await;
                Err(AuthError::ReauthRequired {
                    instance_id: instance_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Persist new tokens durably, then in the cache.
    async fn store_tokens(
        &self,
        entry: &CredentialEntry,
        tokens: RefreshedTokens,
        refreshed: bool,
    ) -> Result<AccessToken, AuthError> {
        let instance_id = entry.instance_id.as_str();
        let now = Utc::now();
        let lifetime = tokens
            .expires_in
            .unwrap_or(self.config.default_token_lifetime);
        let expires_at = now + to_chrono(lifetime);
        let refresh_token = tokens
            .refresh_token
            .or_else(|| entry.refresh_token.clone());
        let scopes = tokens.scopes.unwrap_or_else(|| entry.scopes.clone());

        let update = TokenRecordUpdate {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: refresh_token.clone(),
            expires_at: Some(expires_at),
            status: CredentialStatus::Active,
            scopes: scopes.clone(),
            refresh_attempts: 0,
        };

        match self.durable.write_token_record(instance_id, update).await {
            Ok(()) => {}
            Err(StorageError::RecordNotFound { .. }) => {
                self.store.remove(instance_id);
                tracing::warn!(instance_id, "durable record deleted during refresh");
                return Err(AuthError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                });
            }
            Err(source) => {
                tracing::error!(
                    instance_id,
                    provider = %entry.provider,
                    error = %source,
                    "failed to persist tokens"
                );
                return Err(AuthError::DurableStore {
                    instance_id: instance_id.to_string(),
                    source,
                });
            }
        }

        let mut update = EntryUpdate::new()
            .tokens(TokenUpdate {
                access_token: Some(tokens.access_token.clone()),
                refresh_token,
                expires_at: Some(expires_at),
                scopes: Some(scopes.clone()),
            })
            .refresh_attempts(0)
            .status(CredentialStatus::Active);
        if refreshed {
            update = update.last_refreshed_at(now);
        }

        // An entry evicted meanwhile is reloaded from the durable record on next access.
        self.store.update_metadata(instance_id, update);

        Ok(AccessToken::new(tokens.access_token, Some(expires_at), scopes))
    }

    async fn record_transient_failure(
        &self,
        entry: &CredentialEntry,
        reason: String,
        retry_after: Option<std::time::Duration>,
    ) -> Result<AccessToken, AuthError> {
        let instance_id = entry.instance_id.as_str();
        let attempts = entry.refresh_attempts + 1;

        if attempts >= self.config.max_refresh_attempts {
            self.store
                .update_metadata(instance_id, EntryUpdate::new().refresh_attempts(attempts));
            tracing::error!(
                instance_id,
                provider = %entry.provider,
                attempt = attempts,
                reason = %reason,
                "refresh attempt ceiling reached"
            );
            self.mark_reauth(entry, "attempt_ceiling").await;
            return Err(AuthError::AttemptCeilingExceeded {
                instance_id: instance_id.to_string(),
                attempts,
            });
        }

        self.store.update_metadata(
            instance_id,
            EntryUpdate::new()
                .status(CredentialStatus::Failed)
                .refresh_attempts(attempts),
        );
        tracing::warn!(
            instance_id,
            provider = %entry.provider,
            attempt = attempts,
            reason = %reason,
            "transient refresh failure"
        );

        let mut update = TokenRecordUpdate::from_entry(entry);
        update.status = CredentialStatus::Failed;
        update.refresh_attempts = attempts;
        if let Err(error) = self.durable.write_token_record(instance_id, update).await {
            tracing::warn!(instance_id, error = %error, "failed to record refresh failure");
        }

        Err(AuthError::TransientFailure {
            instance_id: instance_id.to_string(),
            attempts,
            reason,
            retry_after,
        })
    }

    /// Purge secrets and flag the instance for re-authorization.
    async fn mark_reauth(&self, entry: &CredentialEntry, reason: &str) {
        let instance_id = entry.instance_id.as_str();
        self.store.update_metadata(
            instance_id,
            EntryUpdate::new()
                .tokens(TokenUpdate::cleared())
                .status(CredentialStatus::RequiresReauth),
        );
        self.metrics.record_reauth(&entry.provider, reason);

        let update =
            TokenRecordUpdate::cleared(CredentialStatus::RequiresReauth, entry.scopes.clone());
        match self.durable.write_token_record(instance_id, update).await {
            Ok(()) => {}
            Err(StorageError::RecordNotFound { .. }) => {
                self.store.remove(instance_id);
            }
            Err(error) => {
                tracing::error!(
                    instance_id,
                    provider = %entry.provider,
                    error = %error,
                    "failed to persist re-authorization status"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::MockTokenRefresher;
    use crate::token::durable::MockDurableAdapter;
    use crate::types::ClientCredentials;
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use secrecy::{ExposeSecret, SecretString};
    use std::time::Duration;

    type Coordinator = RefreshCoordinator<MockDurableAdapter, MockTokenRefresher>;

    fn record(expires_in_secs: i64) -> TokenRecord {
        let mut record = TokenRecord::pending("owner-1", "gmail").with_client(
            ClientCredentials::new("client", "secret", "https://oauth.example.com/token"),
        );
        record.access_token = Some(SecretString::new("old-access".to_string()));
        record.refresh_token = Some(SecretString::new("old-refresh".to_string()));
        record.expires_at = Some(Utc::now() + ChronoDuration::seconds(expires_in_secs));
        record.status = CredentialStatus::Active;
        record
    }

    fn setup(
        expires_in_secs: i64,
    ) -> (
        Arc<Coordinator>,
        Arc<MockDurableAdapter>,
        Arc<MockTokenRefresher>,
    ) {
        let durable = Arc::new(MockDurableAdapter::new());
        durable.add_record("inst-1", record(expires_in_secs));
        let refresher = Arc::new(MockTokenRefresher::new());
        let coordinator = Arc::new(RefreshCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(EntryStore::default()),
            durable.clone(),
            refresher.clone(),
        ));
        (coordinator, durable, refresher)
    }

    fn fresh_tokens(access: &str) -> RefreshedTokens {
        RefreshedTokens::new(access, Some(Duration::from_secs(3600)), "mock")
    }

    fn transient() -> RefreshError {
        RefreshError::TransientFailure {
            reason: "503".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_served_without_refresh() {
        let (coordinator, durable, refresher) = setup(3600);

        let token = coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(token.secret(), "old-access");
        let token = coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(token.secret(), "old-access");

        assert_eq!(refresher.call_count(), 0);
        assert_eq!(durable.get_read_history().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.queue(Ok(fresh_tokens("new-access")));

        let token = coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(token.secret(), "new-access");

        let entry = coordinator.store().peek("inst-1").unwrap();
        assert_eq!(entry.status, CredentialStatus::Active);
        assert_eq!(entry.refresh_attempts, 0);
        assert!(entry.last_refreshed_at.is_some());
        assert_eq!(entry.refresh_token.unwrap().expose_secret(), "old-refresh");

        let stored = durable.get_record("inst-1").unwrap();
        assert_eq!(stored.access_token.unwrap().expose_secret(), "new-access");
        assert_eq!(stored.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_token_inside_safety_buffer_is_refreshed() {
        let (coordinator, _durable, refresher) = setup(120);
        refresher.queue(Ok(fresh_tokens("new-access")));

        let token = coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(token.secret(), "new-access");
        assert_eq!(refresher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_persisted() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.queue(Ok(fresh_tokens("new-access").with_refresh_token("new-refresh")));

        coordinator.ensure_valid_token("inst-1").await.unwrap();

        let entry = coordinator.store().peek("inst-1").unwrap();
        assert_eq!(entry.refresh_token.unwrap().expose_secret(), "new-refresh");
        let stored = durable.get_record("inst-1").unwrap();
        assert_eq!(stored.refresh_token.unwrap().expose_secret(), "new-refresh");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (coordinator, _durable, refresher) = setup(-1);
        refresher
            .set_delay(Duration::from_millis(50))
            .queue(Ok(fresh_tokens("shared")));

        let calls = (0..20).map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_valid_token("inst-1").await })
        });
        let results = join_all(calls).await;

        assert_eq!(refresher.call_count(), 1);
        for result in results {
            assert_eq!(result.unwrap().unwrap().secret(), "shared");
        }
    }

    #[tokio::test]
    async fn test_protocol_rejection_purges_secrets() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.queue(Err(RefreshError::RequiresReauth {
            strategy: Some("direct_provider".to_string()),
            reason: "invalid_grant".to_string(),
        }));

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(matches!(error, AuthError::ReauthRequired { .. }));

        let entry = coordinator.store().peek("inst-1").unwrap();
        assert_eq!(entry.status, CredentialStatus::RequiresReauth);
        assert!(entry.access_token.is_none());
        assert!(entry.refresh_token.is_none());

        let stored = durable.get_record("inst-1").unwrap();
        assert!(stored.access_token.is_none());
        assert!(stored.refresh_token.is_none());
        assert_eq!(stored.status, CredentialStatus::RequiresReauth);

        // No further network calls once flagged.
        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(error.is_terminal());
        assert_eq!(refresher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_hit_attempt_ceiling() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.set_default(Err(transient()));

        for attempt in 1..5 {
            let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
            assert!(error.is_retryable());
            let entry = coordinator.store().peek("inst-1").unwrap();
            assert_eq!(entry.refresh_attempts, attempt);
            assert_eq!(entry.status, CredentialStatus::Failed);
            assert!(entry.refresh_token.is_some());
            assert_eq!(durable.get_record("inst-1").unwrap().refresh_attempts, attempt);
        }

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(matches!(
            error,
            AuthError::AttemptCeilingExceeded { attempts: 5, .. }
        ));
        let entry = coordinator.store().peek("inst-1").unwrap();
        assert_eq!(entry.status, CredentialStatus::RequiresReauth);
        assert!(!entry.has_tokens());
        assert_eq!(refresher.call_count(), 5);
    }

    #[tokio::test]
    async fn test_success_resets_attempts() {
        let (coordinator, _durable, refresher) = setup(-1);
        refresher
            .queue(Err(transient()))
            .queue(Err(transient()))
            .queue(Ok(fresh_tokens("recovered")));

        assert!(coordinator.ensure_valid_token("inst-1").await.is_err());
        assert!(coordinator.ensure_valid_token("inst-1").await.is_err());
        let token = coordinator.ensure_valid_token("inst-1").await.unwrap();

        assert_eq!(token.secret(), "recovered");
        assert_eq!(coordinator.store().peek("inst-1").unwrap().refresh_attempts, 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (coordinator, _durable, _refresher) = setup(3600);
        let error = coordinator.ensure_valid_token("missing").await.unwrap_err();
        assert!(matches!(error, AuthError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_durable_read_failure_leaves_cache_unchanged() {
        let (coordinator, durable, _refresher) = setup(3600);
        durable.set_next_error(StorageError::Unavailable {
            message: "pool exhausted".to_string(),
        });

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(matches!(error, AuthError::DurableStore { .. }));
        assert!(coordinator.store().is_empty());
    }

    #[tokio::test]
    async fn test_durable_write_failure_keeps_previous_tokens() {
        let (coordinator, durable, refresher) = setup(-1);
        coordinator.load_instance("inst-1").await.unwrap();
        refresher.queue(Ok(fresh_tokens("lost")));
        durable.set_next_error(StorageError::WriteFailed {
            message: "deadlock".to_string(),
        });

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(error.is_retryable());

        let entry = coordinator.store().peek("inst-1").unwrap();
        assert_eq!(entry.access_token.unwrap().expose_secret(), "old-access");
        assert_eq!(entry.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_refresh_budget_elapsed_is_transient() {
        let durable = Arc::new(MockDurableAdapter::new());
        durable.add_record("inst-1", record(-1));
        let refresher = Arc::new(MockTokenRefresher::new());
        refresher
            .set_delay(Duration::from_millis(200))
            .set_default(Ok(fresh_tokens("late")));
        let coordinator = RefreshCoordinator::new(
            CoordinatorConfig {
                refresh_timeout: Duration::from_millis(20),
                ..CoordinatorConfig::default()
            },
            Arc::new(EntryStore::default()),
            durable,
            refresher,
        );

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(matches!(error, AuthError::TransientFailure { attempts: 1, .. }));
        // Lock released: a second call reaches the refresher again.
        assert!(coordinator.ensure_valid_token("inst-1").await.is_err());
    }

    #[tokio::test]
    async fn test_authorization_lifecycle() {
        let durable = Arc::new(MockDurableAdapter::new());
        let refresher = Arc::new(MockTokenRefresher::new());
        let coordinator = RefreshCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(EntryStore::default()),
            durable.clone(),
            refresher.clone(),
        );

        let entry = coordinator
            .begin_authorization("inst-9", "owner-9", "dropbox")
            .await
            .unwrap();
        assert_eq!(entry.status, CredentialStatus::Pending);

        let error = coordinator.ensure_valid_token("inst-9").await.unwrap_err();
        assert!(matches!(error, AuthError::AuthorizationPending { .. }));
        assert_eq!(refresher.call_count(), 0);

        coordinator
            .complete_authorization(
                "inst-9",
                fresh_tokens("first").with_refresh_token("first-refresh"),
            )
            .await
            .unwrap();
        let token = coordinator.ensure_valid_token("inst-9").await.unwrap();
        assert_eq!(token.secret(), "first");
        assert_eq!(
            durable.get_record("inst-9").unwrap().status,
            CredentialStatus::Active
        );

        // Re-authorization resets the existing record.
        coordinator
            .begin_authorization("inst-9", "owner-9", "dropbox")
            .await
            .unwrap();
        assert!(durable.get_record("inst-9").unwrap().access_token.is_none());
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_valid_token() {
        let (coordinator, _durable, refresher) = setup(3600);
        refresher.queue(Ok(fresh_tokens("forced")));

        let token = coordinator.force_refresh("inst-1").await.unwrap();
        assert_eq!(token.secret(), "forced");
        assert_eq!(refresher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_reloads_from_durable() {
        let (coordinator, durable, _refresher) = setup(3600);
        coordinator.ensure_valid_token("inst-1").await.unwrap();

        assert!(coordinator.invalidate("inst-1"));
        coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(durable.get_read_history().len(), 2);
    }

    #[tokio::test]
    async fn test_attempts_survive_reload() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.set_default(Err(transient()));

        for _ in 0..4 {
            assert!(coordinator.ensure_valid_token("inst-1").await.is_err());
        }
        assert!(coordinator.invalidate("inst-1"));

        let entry = coordinator.load_instance("inst-1").await.unwrap();
        assert_eq!(entry.refresh_attempts, 4);

        let error = coordinator.ensure_valid_token("inst-1").await.unwrap_err();
        assert!(matches!(
            error,
            AuthError::AttemptCeilingExceeded { attempts: 5, .. }
        ));
        assert_eq!(refresher.call_count(), 5);
        let record = durable.get_record("inst-1").unwrap();
        assert_eq!(record.status, CredentialStatus::RequiresReauth);
        assert_eq!(record.refresh_attempts, 0);
    }

    #[tokio::test]
    async fn test_lock_slots_released_with_entry() {
        let (coordinator, durable, refresher) = setup(-1);
        refresher.set_default(Ok(fresh_tokens("new-access")));

        coordinator.ensure_valid_token("inst-1").await.unwrap();
        assert_eq!(coordinator.locks().len(), 1);
        assert!(coordinator.invalidate("inst-1"));
        assert!(coordinator.locks().is_empty());

        // Record deleted while the entry is still cached.
        durable.add_record("inst-2", record(-1));
        coordinator.load_instance("inst-2").await.unwrap();
        durable.delete_record("inst-2");
        let error = coordinator.ensure_valid_token("inst-2").await.unwrap_err();
        assert!(matches!(error, AuthError::InstanceNotFound { .. }));
        assert!(coordinator.store().peek("inst-2").is_none());
        assert!(coordinator.locks().is_empty());

        let error = coordinator
            .complete_authorization("unknown", fresh_tokens("x"))
            .await
            .unwrap_err();
        assert!(matches!(error, AuthError::InstanceNotFound { .. }));
        assert!(coordinator.locks().is_empty());
    }
}
