//! Reconciliation run report.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why an entry left the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// Unused for longer than the staleness threshold.
    Stale,
    /// Holds neither an access nor a refresh token.
    Invalid,
    /// Expired with no successful refresh behind it.
    Expired,
    /// The durable record no longer exists.
    Orphaned,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Orphaned => "orphaned",
        }
    }
}

/// Outcome of one reconciliation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    /// Entries compared against the durable store.
    pub checked: usize,
    pub evicted_stale: usize,
    pub evicted_invalid: usize,
    pub evicted_expired: usize,
    pub evicted_orphaned: usize,
    /// Entries replaced with durable values.
    pub overwritten: usize,
    /// Entries confirmed unchanged.
    pub synced: usize,
    /// Entries left alone because a refresh held them or they changed mid-read.
    pub skipped: usize,
    /// Durable reads that failed.
    pub errors: usize,
    pub duration_ms: u64,
}

impl ReconcileReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            checked: 0,
            evicted_stale: 0,
            evicted_invalid: 0,
            evicted_expired: 0,
            evicted_orphaned: 0,
            overwritten: 0,
            synced: 0,
            skipped: 0,
            errors: 0,
            duration_ms: 0,
        }
    }

    pub fn record_eviction(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Stale => self.evicted_stale += 1,
            EvictionReason::Invalid => self.evicted_invalid += 1,
            EvictionReason::Expired => self.evicted_expired += 1,
            EvictionReason::Orphaned => self.evicted_orphaned += 1,
        }
    }

    /// Total evictions across all reasons.
    pub fn evicted(&self) -> usize {
        self.evicted_stale + self.evicted_invalid + self.evicted_expired + self.evicted_orphaned
    }
}
