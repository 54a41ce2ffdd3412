//! Integration tests for reconciliation through the access facade.

use chrono::{Duration as ChronoDuration, Utc};
use integrations_credentials::*;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

fn active_record(access_token: &str) -> TokenRecord {
    let mut record = TokenRecord::pending("owner-1", "github");
    record.access_token = Some(SecretString::new(access_token.to_string()));
    record.refresh_token = Some(SecretString::new("refresh".to_string()));
    record.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
    record.status = CredentialStatus::Active;
    record
}

fn create_facade(
    config: CoordinatorConfig,
    durable: Arc<InMemoryDurableAdapter>,
) -> AccessFacade<InMemoryDurableAdapter, MockTokenRefresher> {
    AccessFacade::new(
        config,
        durable,
        Arc::new(MockTokenRefresher::new()),
        Arc::new(no_op_metrics()),
    )
}

#[tokio::test]
async fn test_deleted_record_is_evicted() {
    let durable = Arc::new(InMemoryDurableAdapter::new());
    durable.insert("inst-1", active_record("access-1"));
    let facade = create_facade(CoordinatorConfig::default(), durable.clone());

    assert_eq!(
        facade.get_bearer_token("inst-1").await.unwrap().secret(),
        "access-1"
    );

    durable.delete("inst-1");
    let report = facade.reconcile_now().await;
    assert_eq!(report.evicted_orphaned, 1);
    assert_eq!(facade.statistics().cache.total, 0);

    let error = facade.get_bearer_token("inst-1").await.unwrap_err();
    assert!(matches!(error, AccessError::NotFound { .. }));

    // A second run finds nothing left to evict.
    let report = facade.reconcile_now().await;
    assert_eq!(report.evicted(), 0);
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_durable_changes_replace_cached_values() {
    let durable = Arc::new(InMemoryDurableAdapter::new());
    durable.insert("inst-1", active_record("access-1"));
    let facade = create_facade(CoordinatorConfig::default(), durable.clone());

    facade.get_bearer_token("inst-1").await.unwrap();

    // Another process refreshed the instance.
    durable.insert("inst-1", active_record("access-2"));
    let report = facade.reconcile_now().await;
    assert_eq!(report.overwritten, 1);

    assert_eq!(
        facade.get_bearer_token("inst-1").await.unwrap().secret(),
        "access-2"
    );

    let report = facade.reconcile_now().await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.overwritten, 0);
}

#[tokio::test]
async fn test_idle_entries_are_swept() {
    let durable = Arc::new(InMemoryDurableAdapter::new());
    durable.insert("inst-1", active_record("access-1"));
    let config = credential_config()
        .staleness_threshold(Duration::ZERO)
        .build()
        .unwrap();
    let facade = create_facade(config, durable);

    facade.get_bearer_token("inst-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = facade.reconcile_now().await;
    assert_eq!(report.evicted_stale, 1);

    // The durable record is intact, so the entry simply reloads.
    assert_eq!(
        facade.get_bearer_token("inst-1").await.unwrap().secret(),
        "access-1"
    );
}

#[tokio::test]
async fn test_sweeps_do_not_reset_refresh_attempts() {
    let durable = Arc::new(InMemoryDurableAdapter::new());
    let mut record = active_record("access-1");
    record.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
    durable.insert("inst-1", record);

    // Every refresh fails transiently.
    let refresher = Arc::new(MockTokenRefresher::new());
    let facade = AccessFacade::new(
        CoordinatorConfig::default(),
        durable.clone(),
        refresher.clone(),
        Arc::new(no_op_metrics()),
    );

    let mut rounds = 0;
    loop {
        let error = facade.get_bearer_token("inst-1").await.unwrap_err();
        if error.requires_reauth() {
            break;
        }
        assert!(error.is_retryable());
        facade.reconcile_now().await;
        rounds += 1;
        assert!(rounds < 10, "attempt ceiling never reached");
    }

    assert_eq!(refresher.call_count(), 5);
    assert_eq!(
        durable.get("inst-1").unwrap().status,
        CredentialStatus::RequiresReauth
    );

    let error = facade.get_bearer_token("inst-1").await.unwrap_err();
    assert!(error.requires_reauth());
    assert_eq!(refresher.call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_runs_on_interval() {
    let durable = Arc::new(InMemoryDurableAdapter::new());
    durable.insert("inst-1", active_record("access-1"));
    let config = credential_config()
        .reconcile_initial_delay(Duration::from_secs(1))
        .reconcile_interval(Duration::from_secs(60))
        .preload_on_init(true)
        .build()
        .unwrap();

    let facade = AccessFacade::init(config, durable.clone(), Arc::new(MockTokenRefresher::new()))
        .await;
    assert!(facade.is_running());
    assert!(facade.statistics().last_reconcile.is_none());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let first = facade.statistics().last_reconcile.unwrap();
    assert_eq!(first.synced, 1);

    durable.delete("inst-1");
    tokio::time::sleep(Duration::from_secs(60)).await;
    let second = facade.statistics().last_reconcile.unwrap();
    assert_eq!(second.evicted_orphaned, 1);

    facade.shutdown().await;
    assert!(!facade.is_running());
}
