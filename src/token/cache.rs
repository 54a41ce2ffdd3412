//! Entry Store
//!
//! In-memory cache of credential entries, sharded by instance id.
//!
//! Every operation is synchronous and holds at most one shard lock for the
//! duration of the call; nothing here is ever held across an `.await`.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{CredentialEntry, CredentialStatus, EntryUpdate};

/// Aggregate view over the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub near_expiry: usize,
    /// Entries per `refresh_attempts` value.
    pub refresh_attempt_distribution: BTreeMap<u32, usize>,
}

/// Concurrent credential cache.
#[derive(Debug)]
pub struct EntryStore {
    entries: DashMap<String, CredentialEntry>,
    revisions: AtomicU64,
    near_expiry_window: Duration,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

impl EntryStore {
    /// Create an empty store; `near_expiry_window` only affects statistics.
    pub fn new(near_expiry_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            revisions: AtomicU64::new(0),
            near_expiry_window,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an entry for use, touching `last_used_at`.
    pub fn get(&self, instance_id: &str) -> Option<CredentialEntry> {
        self.entries.get_mut(instance_id).map(|mut entry| {
            entry.last_used_at = Utc::now();
            entry.clone()
        })
    }

    /// Look up an entry without marking it used.
    pub fn peek(&self, instance_id: &str) -> Option<CredentialEntry> {
        self.entries.get(instance_id).map(|entry| entry.clone())
    }

    /// Insert or replace an entry.
    pub fn put(&self, instance_id: impl Into<String>, mut entry: CredentialEntry) {
        let instance_id = instance_id.into();
        entry.instance_id = instance_id.clone();
        entry.last_modified_at = Utc::now();
        entry.revision = self.next_revision();
        self.entries.insert(instance_id, entry);
    }

    /// Insert only if no entry exists. Returns the entry now cached.
    pub fn put_if_absent(&self, instance_id: &str, mut entry: CredentialEntry) -> CredentialEntry {
        self.entries
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                entry.instance_id = instance_id.to_string();
                entry.last_modified_at = Utc::now();
                entry.revision = self.next_revision();
                entry
            })
            .clone()
    }

    /// Apply a partial update. Returns false if the entry is missing.
    pub fn update_metadata(&self, instance_id: &str, update: EntryUpdate) -> bool {
        match self.entries.get_mut(instance_id) {
            Some(mut entry) => {
                if update.apply_to(&mut entry) {
                    entry.last_modified_at = Utc::now();
                    entry.revision = self.next_revision();
                }
                true
            }
            None => false,
        }
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, instance_id: &str) -> bool {
        self.entries.remove(instance_id).is_some()
    }

    /// Remove an entry only if `predicate` holds, checked under the shard lock.
    pub fn remove_if<F>(&self, instance_id: &str, predicate: F) -> bool
    where
        F: FnOnce(&CredentialEntry) -> bool,
    {
        self.entries
            .remove_if(instance_id, |_, entry| predicate(entry))
            .is_some()
    }

    /// Run `f` on the entry only if its revision is still `expected_revision`.
    ///
    /// Returns false when the entry is gone or was modified in between.
    pub fn apply_if_unmodified<F>(&self, instance_id: &str, expected_revision: u64, f: F) -> bool
    where
        F: FnOnce(&mut CredentialEntry),
    {
        match self.entries.get_mut(instance_id) {
            Some(mut entry) if entry.revision == expected_revision => {
                f(&mut entry);
                entry.revision = self.next_revision();
                true
            }
            _ => false,
        }
    }

    /// Record a confirmed durable sync without counting it as a modification.
    pub fn mark_synced(&self, instance_id: &str, expected_revision: u64) -> bool {
        match self.entries.get_mut(instance_id) {
            Some(mut entry) if entry.revision == expected_revision => {
                entry.last_synced_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Cached instance ids.
    pub fn list_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Copies of all entries, without touching `last_used_at`.
    pub fn snapshot(&self) -> Vec<CredentialEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn statistics(&self) -> CacheStatistics {
        let now = Utc::now();
        let mut stats = CacheStatistics::default();

        for entry in self.entries.iter() {
            stats.total += 1;
            if entry.status == CredentialStatus::Active {
                stats.active += 1;
            }
            if entry.is_expired(now) {
                stats.expired += 1;
            } else if entry.is_near_expiry(now, self.near_expiry_window) {
                stats.near_expiry += 1;
            }
            *stats
                .refresh_attempt_distribution
                .entry(entry.refresh_attempts)
                .or_insert(0) += 1;
        }

        stats
    }
}
