//! Durable Adapter
//!
//! Interface to the durable token store, plus in-memory and mock
//! implementations.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::StorageError;
use crate::types::{CredentialStatus, TokenRecord, TokenRecordUpdate};

/// Durable token store interface.
///
/// The durable record is canonical: the cache yields to it on conflict.
#[async_trait]
pub trait DurableAdapter: Send + Sync {
    /// Read the record for an instance. `None` means the instance is gone.
    async fn read_token_record(&self, instance_id: &str)
        -> Result<Option<TokenRecord>, StorageError>;

    /// Overwrite the token fields of an existing record.
    ///
    /// Returns `StorageError::RecordNotFound` if the record was deleted.
    async fn write_token_record(
        &self,
        instance_id: &str,
        update: TokenRecordUpdate,
    ) -> Result<(), StorageError>;

    /// Ids of every instance holding usable or renewable credentials.
    async fn read_all_active_instance_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Create a new record.
    ///
    /// Returns `StorageError::RecordExists` if one is already present.
    async fn create_token_record(
        &self,
        instance_id: &str,
        record: TokenRecord,
    ) -> Result<(), StorageError>;
}

fn is_active(status: CredentialStatus) -> bool {
    matches!(
        status,
        CredentialStatus::Active | CredentialStatus::Refreshing | CredentialStatus::Failed
    )
}

/// In-memory durable store.
#[derive(Default)]
pub struct InMemoryDurableAdapter {
    records: Mutex<HashMap<String, TokenRecord>>,
}

impl InMemoryDurableAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly.
    pub fn insert(&self, instance_id: impl Into<String>, record: TokenRecord) -> &Self {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.into(), record);
        self
    }

    /// Delete a record, as another process would.
    pub fn delete(&self, instance_id: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
            .is_some()
    }

    pub fn get(&self, instance_id: &str) -> Option<TokenRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableAdapter for InMemoryDurableAdapter {
    async fn read_token_record(
        &self,
        instance_id: &str,
    ) -> Result<Option<TokenRecord>, StorageError> {
        Ok(self.get(instance_id))
    }

    async fn write_token_record(
        &self,
        instance_id: &str,
        update: TokenRecordUpdate,
    ) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(instance_id) {
            Some(record) => {
                record.apply(update);
                Ok(())
            }
            None => Err(StorageError::RecordNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    async fn read_all_active_instance_ids(&self) -> Result<Vec<String>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|(_, record)| is_active(record.status))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_token_record(
        &self,
        instance_id: &str,
        record: TokenRecord,
    ) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(instance_id) {
            return Err(StorageError::RecordExists {
                instance_id: instance_id.to_string(),
            });
        }
        records.insert(instance_id.to_string(), record);
        Ok(())
    }
}

/// Mock durable store for testing.
///
/// Backed by an [`InMemoryDurableAdapter`], with call histories and
/// injectable failures.
#[derive(Default)]
pub struct MockDurableAdapter {
    inner: InMemoryDurableAdapter,
    read_history: Mutex<Vec<String>>,
    write_history: Mutex<Vec<(String, TokenRecordUpdate)>>,
    create_history: Mutex<Vec<String>>,
    next_error: Mutex<Option<StorageError>>,
    should_fail: Mutex<bool>,
    read_errors: Mutex<HashSet<String>>,
    read_delay: Mutex<Option<Duration>>,
}

impl MockDurableAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a record.
    pub fn add_record(&self, instance_id: &str, record: TokenRecord) -> &Self {
        self.inner.insert(instance_id, record);
        self
    }

    /// Delete a record behind the cache's back.
    pub fn delete_record(&self, instance_id: &str) -> bool {
        self.inner.delete(instance_id)
    }

    pub fn get_record(&self, instance_id: &str) -> Option<TokenRecord> {
        self.inner.get(instance_id)
    }

    /// Set next error to return.
    pub fn set_next_error(&self, error: StorageError) -> &Self {
        *self.next_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self
    }

    /// Set storage to fail all operations.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        *self.should_fail.lock().unwrap_or_else(PoisonError::into_inner) = should_fail;
        self
    }

    /// Fail every read of one instance.
    pub fn fail_reads_for(&self, instance_id: &str) -> &Self {
        self.read_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string());
        self
    }

    /// Sleep inside every record read.
    pub fn set_read_delay(&self, delay: Duration) -> &Self {
        *self.read_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    pub fn get_read_history(&self) -> Vec<String> {
        self.read_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_write_history(&self) -> Vec<(String, TokenRecordUpdate)> {
        self.write_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_create_history(&self) -> Vec<String> {
        self.create_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_error(&self) -> Result<(), StorageError> {
        if *self.should_fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(StorageError::Unavailable {
                message: "Mock storage failure".to_string(),
            });
        }

        if let Some(error) = self
            .next_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(error);
        }

        Ok(())
    }
}

#[async_trait]
impl DurableAdapter for MockDurableAdapter {
    async fn read_token_record(
        &self,
        instance_id: &str,
    ) -> Result<Option<TokenRecord>, StorageError> {
        self.check_error()?;
        self.read_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance_id.to_string());

        let delay = *self.read_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .read_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(instance_id);
        if fail {
            return Err(StorageError::ReadFailed {
                message: format!("Mock read failure for {}", instance_id),
            });
        }

        self.inner.read_token_record(instance_id).await
    }

    async fn write_token_record(
        &self,
        instance_id: &str,
        update: TokenRecordUpdate,
    ) -> Result<(), StorageError> {
        self.check_error()?;
        self.write_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((instance_id.to_string(), update.clone()));
        self.inner.write_token_record(instance_id, update).await
    }

    async fn read_all_active_instance_ids(&self) -> Result<Vec<String>, StorageError> {
        self.check_error()?;
        self.inner.read_all_active_instance_ids().await
    }

    async fn create_token_record(
        &self,
        instance_id: &str,
        record: TokenRecord,
    ) -> Result<(), StorageError> {
        self.check_error()?;
        self.create_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance_id.to_string());
        self.inner.create_token_record(instance_id, record).await
    }
}
