//! Metrics
//!
//! Credential cache and refresh metrics interfaces and implementations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Metric labels.
pub type MetricLabels = HashMap<String, String>;

/// Credential metrics interface.
pub trait CredentialMetrics: Send + Sync {
    /// Record a lookup served from (or missed by) the entry store.
    fn record_cache_lookup(&self, provider: &str, hit: bool);

    /// Record the outcome of one renewal strategy.
    fn record_refresh(&self, provider: &str, strategy: &str, outcome: &str);

    /// Record total refresh duration, fallbacks included.
    fn record_refresh_duration(&self, provider: &str, duration_ms: f64);

    /// Record a transition to `requires_reauth`.
    fn record_reauth(&self, provider: &str, reason: &str);

    /// Record an entry evicted by reconciliation.
    fn record_eviction(&self, reason: &str);

    /// Record a reconciliation run.
    fn record_reconcile_duration(&self, duration_ms: f64);

    /// Set cached entries gauge.
    fn set_cached_entries(&self, count: u64);
}

/// No-op metrics implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl CredentialMetrics for NoOpMetrics {
    fn record_cache_lookup(&self, _provider: &str, _hit: bool) {}
    fn record_refresh(&self, _provider: &str, _strategy: &str, _outcome: &str) {}
    fn record_refresh_duration(&self, _provider: &str, _duration_ms: f64) {}
    fn record_reauth(&self, _provider: &str, _reason: &str) {}
    fn record_eviction(&self, _reason: &str) {}
    fn record_reconcile_duration(&self, _duration_ms: f64) {}
    fn set_cached_entries(&self, _count: u64) {}
}

/// No-op metrics singleton.
pub fn no_op_metrics() -> NoOpMetrics {
    NoOpMetrics
}

/// Metric entry for in-memory storage.
#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub name: String,
    pub value: f64,
    pub labels: MetricLabels,
    pub timestamp: u64,
}

/// In-memory metrics for testing.
#[derive(Default)]
pub struct InMemoryMetrics {
    entries: Mutex<Vec<MetricEntry>>,
}

impl InMemoryMetrics {
    /// Create new in-memory metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded entries.
    pub fn get_entries(&self) -> Vec<MetricEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get entries by name.
    pub fn get_entries_by_name(&self, name: &str) -> Vec<MetricEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Sum of values recorded under `name` whose labels include `label = value`.
    pub fn total(&self, name: &str, label: &str, value: &str) -> f64 {
        self.get_entries_by_name(name)
            .iter()
            .filter(|e| e.labels.get(label).map(String::as_str) == Some(value))
            .map(|e| e.value)
            .sum()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, name: &str, value: f64, labels: MetricLabels) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MetricEntry {
                name: name.to_string(),
                value,
                labels,
                timestamp: now,
            });
    }
}

fn labels(pairs: &[(&str, &str)]) -> MetricLabels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl CredentialMetrics for InMemoryMetrics {
    fn record_cache_lookup(&self, provider: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.record(
            "credentials_cache_lookups_total",
            1.0,
            labels(&[("provider", provider), ("result", result)]),
        );
    }

    fn record_refresh(&self, provider: &str, strategy: &str, outcome: &str) {
        self.record(
            "credentials_refreshes_total",
            1.0,
            labels(&[
                ("provider", provider),
                ("strategy", strategy),
                ("outcome", outcome),
            ]),
        );
    }

    fn record_refresh_duration(&self, provider: &str, duration_ms: f64) {
        self.record(
            "credentials_refresh_duration_ms",
            duration_ms,
            labels(&[("provider", provider)]),
        );
    }

    fn record_reauth(&self, provider: &str, reason: &str) {
        self.record(
            "credentials_reauth_total",
            1.0,
            labels(&[("provider", provider), ("reason", reason)]),
        );
    }

    fn record_eviction(&self, reason: &str) {
        self.record(
            "credentials_evictions_total",
            1.0,
            labels(&[("reason", reason)]),
        );
    }

    fn record_reconcile_duration(&self, duration_ms: f64) {
        self.record(
            "credentials_reconcile_duration_ms",
            duration_ms,
            MetricLabels::new(),
        );
    }

    fn set_cached_entries(&self, count: u64) {
        self.record("credentials_cached_entries", count as f64, MetricLabels::new());
    }
}

/// Create in-memory metrics for testing.
pub fn create_in_memory_metrics() -> InMemoryMetrics {
    InMemoryMetrics::new()
}
