//! Per-instance refresh locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One async mutex per instance id.
///
/// Slots are created on first use and released once the instance leaves the
/// cache and nobody holds or waits on the slot.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock slot for an instance.
    pub fn slot(&self, instance_id: &str) -> Arc<Mutex<()>> {
        if let Some(slot) = self.slots.get(instance_id) {
            return slot.clone();
        }
        self.slots
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a refresh currently holds the instance's lock.
    pub fn is_held(&self, instance_id: &str) -> bool {
        self.slots
            .get(instance_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the slot if no task holds a handle to it.
    pub fn release_if_idle(&self, instance_id: &str) -> bool {
        self.slots
            .remove_if(instance_id, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_instance_shares_slot() {
        let locks = InstanceLocks::new();
        let a = locks.slot("inst-1");
        let b = locks.slot("inst-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &locks.slot("inst-2")));
    }

    #[tokio::test]
    async fn test_is_held() {
        let locks = InstanceLocks::new();
        let slot = locks.slot("inst-1");
        assert!(!locks.is_held("inst-1"));

        let guard = slot.lock().await;
        assert!(locks.is_held("inst-1"));
        drop(guard);
        assert!(!locks.is_held("inst-1"));
        assert!(!locks.is_held("unknown"));
    }

    #[tokio::test]
    async fn test_release_only_when_idle() {
        let locks = InstanceLocks::new();
        let slot = locks.slot("inst-1");

        assert!(!locks.release_if_idle("inst-1"));
        drop(slot);
        assert!(locks.release_if_idle("inst-1"));
        assert!(locks.is_empty());
    }
}
