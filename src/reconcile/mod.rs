//! Reconciliation
//!
//! Periodic task keeping the entry store consistent with the durable store.
//!
//! Each run first sweeps entries that are idle, hold no tokens, or expired
//! without a successful refresh, then compares every remaining entry with
//! its durable record. It never starts a refresh.

pub mod report;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::telemetry::{CredentialMetrics, NoOpMetrics};
use crate::token::cache::EntryStore;
use crate::token::durable::DurableAdapter;
use crate::token::locks::InstanceLocks;
use crate::types::entry::to_chrono;
use crate::types::{CredentialEntry, ReconcileConfig};

pub use report::{EvictionReason, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Synced,
    Overwritten,
    Evicted,
    Skipped,
    Failed,
    Gone,
}

/// Reconciles cached entries with the durable store.
pub struct ReconciliationLoop<D: DurableAdapter> {
    config: ReconcileConfig,
    store: Arc<EntryStore>,
    durable: Arc<D>,
    locks: Arc<InstanceLocks>,
    metrics: Arc<dyn CredentialMetrics>,
    last_report: Mutex<Option<ReconcileReport>>,
}

impl<D: DurableAdapter> ReconciliationLoop<D> {
    pub fn new(
        config: ReconcileConfig,
        store: Arc<EntryStore>,
        durable: Arc<D>,
        locks: Arc<InstanceLocks>,
    ) -> Self {
        Self {
            config,
            store,
            durable,
            locks,
            metrics: Arc::new(NoOpMetrics),
            last_report: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CredentialMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Report of the most recent completed run.
    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one reconciliation pass.
    pub async fn run_once(&self) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::new(Utc::now());

        self.sweep(&mut report);

        let ids = self.store.list_ids();
        let outcomes: Vec<SyncOutcome> = stream::iter(ids)
            .map(|instance_id| async move { self.sync_one(&instance_id).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SyncOutcome::Synced => report.synced += 1,
                SyncOutcome::Overwritten => report.overwritten += 1,
                SyncOutcome::Evicted => report.record_eviction(EvictionReason::Orphaned),
                SyncOutcome::Skipped => report.skipped += 1,
                SyncOutcome::Failed => report.errors += 1,
                SyncOutcome::Gone => {}
            }
            if !matches!(outcome, SyncOutcome::Gone) {
                report.checked += 1;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .record_reconcile_duration(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics.set_cached_entries(self.store.len() as u64);

        tracing::info!(
            checked = report.checked,
            evicted = report.evicted(),
            overwritten = report.overwritten,
            skipped = report.skipped,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "reconciliation finished"
        );

        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    fn sweep_reason(&self, entry: &CredentialEntry) -> Option<EvictionReason> {
        let now = Utc::now();
        if now - entry.last_used_at > to_chrono(self.config.staleness_threshold) {
            return Some(EvictionReason::Stale);
        }
        if !entry.has_tokens() {
            return Some(EvictionReason::Invalid);
        }
        // Failed attempts are persisted, so a reload keeps the counter.
        if entry.last_refreshed_at.is_none() && entry.is_expired(now) {
            return Some(EvictionReason::Expired);
        }
        None
    }

    fn sweep(&self, report: &mut ReconcileReport) {
        for entry in self.store.snapshot() {
            let instance_id = entry.instance_id.as_str();
            if self.locks.is_held(instance_id) {
                continue;
            }
            let Some(reason) = self.sweep_reason(&entry) else {
                continue;
            };

            let revision = entry.revision;
            if self
                .store
                .remove_if(instance_id, |current| current.revision == revision)
            {
                self.evicted(instance_id, reason);
                report.record_eviction(reason);
            }
        }
    }

    fn evicted(&self, instance_id: &str, reason: EvictionReason) {
        self.locks.release_if_idle(instance_id);
        self.metrics.record_eviction(reason.as_str());
        tracing::debug!(instance_id, reason = reason.as_str(), "credential entry evicted");
    }

    async fn sync_one(&self, instance_id: &str) -> SyncOutcome {
        let Some(entry) = self.store.peek(instance_id) else {
            return SyncOutcome::Gone;
        };
        if self.locks.is_held(instance_id) {
            return SyncOutcome::Skipped;
        }
        let revision = entry.revision;

        let record = match self.durable.read_token_record(instance_id).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(instance_id, error = %error, "reconciliation read failed");
                return SyncOutcome::Failed;
            }
        };

        let Some(record) = record else {
            if self.store.remove(instance_id) {
                self.evicted(instance_id, EvictionReason::Orphaned);
                return SyncOutcome::Evicted;
            }
            return SyncOutcome::Gone;
        };

        if entry.matches_record(&record) {
            return if self.store.mark_synced(instance_id, revision) {
                SyncOutcome::Synced
            } else {
                SyncOutcome::Skipped
            };
        }

        if self.locks.is_held(instance_id) {
            return SyncOutcome::Skipped;
        }

        let applied = self.store.apply_if_unmodified(instance_id, revision, |cached| {
            cached.overwrite_from_record(&record, Utc::now());
        });
        if applied {
            tracing::info!(
                instance_id,
                provider = %record.provider,
                status = %record.status,
                "cached credentials replaced with durable record"
            );
            SyncOutcome::Overwritten
        } else {
            tracing::debug!(instance_id, "entry changed during reconciliation, skipped");
            SyncOutcome::Skipped
        }
    }
}

impl<D: DurableAdapter + 'static> ReconciliationLoop<D> {
    /// Run on the tokio runtime: once after the initial delay, then every
    /// interval, until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> ReconcileHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let initial_delay = self.config.initial_delay;
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.run_once() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
            tracing::debug!("reconciliation loop stopped");
        });

        ReconcileHandle { cancel, task }
    }
}

/// Handle to a spawned reconciliation loop.
pub struct ReconcileHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            tracing::error!(error = %error, "reconciliation task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::durable::MockDurableAdapter;
    use crate::types::{CredentialStatus, EntryUpdate, TokenRecord, TokenUpdate};
    use chrono::Duration as ChronoDuration;
    use secrecy::{ExposeSecret, SecretString};
    use std::time::Duration;

    fn record(access: &str) -> TokenRecord {
        let mut record = TokenRecord::pending("owner-1", "gmail");
        record.access_token = Some(SecretString::new(access.to_string()));
        record.refresh_token = Some(SecretString::new("refresh".to_string()));
        record.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
        record.status = CredentialStatus::Active;
        record
    }

    fn setup() -> (
        Arc<ReconciliationLoop<MockDurableAdapter>>,
        Arc<EntryStore>,
        Arc<MockDurableAdapter>,
        Arc<InstanceLocks>,
    ) {
        let store = Arc::new(EntryStore::default());
        let durable = Arc::new(MockDurableAdapter::new());
        let locks = Arc::new(InstanceLocks::new());
        let reconciler = Arc::new(ReconciliationLoop::new(
            ReconcileConfig::default(),
            store.clone(),
            durable.clone(),
            locks.clone(),
        ));
        (reconciler, store, durable, locks)
    }

    fn cache(store: &EntryStore, durable: &MockDurableAdapter, id: &str, access: &str) {
        let record = record(access);
        durable.add_record(id, record.clone());
        store.put(id, CredentialEntry::from_record(id, &record));
    }

    #[tokio::test]
    async fn test_orphaned_entries_are_evicted_idempotently() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "inst-1", "a");
        cache(&store, &durable, "inst-2", "b");
        durable.delete_record("inst-1");

        let report = reconciler.run_once().await;
        assert_eq!(report.evicted_orphaned, 1);
        assert_eq!(report.synced, 1);
        assert!(store.peek("inst-1").is_none());

        let report = reconciler.run_once().await;
        assert_eq!(report.evicted(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_durable_values_win() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "inst-1", "cached");
        durable.add_record("inst-1", record("rotated-elsewhere"));

        let report = reconciler.run_once().await;
        assert_eq!(report.overwritten, 1);
        let entry = store.peek("inst-1").unwrap();
        assert_eq!(entry.access_token.unwrap().expose_secret(), "rotated-elsewhere");
        assert!(entry.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_rules() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "idle", "a");
        cache(&store, &durable, "expired-failed", "b");
        cache(&store, &durable, "expired-active", "c");
        cache(&store, &durable, "expired-refreshed", "d");
        store.put("no-tokens", CredentialEntry::pending("no-tokens", "owner-1", "gmail"));

        let mut idle = store.peek("idle").unwrap();
        idle.last_used_at = Utc::now() - ChronoDuration::hours(2);
        store.put("idle", idle);

        for id in ["expired-failed", "expired-active", "expired-refreshed"] {
            let mut entry = store.peek(id).unwrap();
            entry.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
            if id == "expired-refreshed" {
                entry.last_refreshed_at = Some(Utc::now() - ChronoDuration::hours(1));
            }
            store.put(id, entry);
        }
        store.update_metadata(
            "expired-failed",
            EntryUpdate::new().status(CredentialStatus::Failed),
        );

        let report = reconciler.run_once().await;
        assert_eq!(report.evicted_stale, 1);
        assert_eq!(report.evicted_invalid, 1);
        assert_eq!(report.evicted_expired, 2);
        assert_eq!(store.list_ids(), vec!["expired-refreshed".to_string()]);
    }

    #[tokio::test]
    async fn test_locked_entries_are_left_alone() {
        let (reconciler, store, durable, locks) = setup();
        cache(&store, &durable, "inst-1", "cached");
        store.update_metadata(
            "inst-1",
            EntryUpdate::new()
                .status(CredentialStatus::Refreshing)
                .tokens(TokenUpdate::cleared()),
        );

        let slot = locks.slot("inst-1");
        let guard = slot.lock().await;
        let report = reconciler.run_once().await;
        drop(guard);

        assert_eq!(report.evicted(), 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            store.peek("inst-1").unwrap().status,
            CredentialStatus::Refreshing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_modified_during_read_is_not_clobbered() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "inst-1", "cached");
        durable.add_record("inst-1", record("durable"));
        durable.set_read_delay(Duration::from_millis(100));

        let run = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.run_once().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.update_metadata(
            "inst-1",
            EntryUpdate::new()
                .tokens(TokenUpdate {
                    access_token: Some(SecretString::new("refreshed".to_string())),
                    refresh_token: Some(SecretString::new("refresh".to_string())),
                    expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
                    scopes: None,
                })
                .refresh_attempts(0),
        );

        let report = run.await.unwrap();
        assert_eq!(report.overwritten, 0);
        assert_eq!(report.skipped, 1);
        let entry = store.peek("inst-1").unwrap();
        assert_eq!(entry.access_token.unwrap().expose_secret(), "refreshed");
    }

    #[tokio::test]
    async fn test_read_errors_are_skipped() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "inst-1", "a");
        cache(&store, &durable, "inst-2", "b");
        durable.fail_reads_for("inst-1");

        let report = reconciler.run_once().await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(reconciler.last_report(), Some(report));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_runs_and_shuts_down() {
        let (reconciler, store, durable, _locks) = setup();
        cache(&store, &durable, "inst-1", "a");
        durable.delete_record("inst-1");

        let handle = reconciler.clone().spawn();
        assert!(reconciler.last_report().is_none());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.is_empty());
        assert_eq!(reconciler.last_report().unwrap().evicted_orphaned, 1);

        handle.shutdown().await;
    }
}
