//! Durable Record Types
//!
//! Shape of the canonical token record kept by the durable store.

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::types::{ClientCredentials, CredentialEntry, CredentialStatus};

/// Canonical token record for one instance.
#[derive(Clone, Debug)]
pub struct TokenRecord {
    /// Tenant/user owning the instance.
    pub owner_id: String,
    /// Provider the instance connects to.
    pub provider: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    pub scopes: Vec<String>,
    /// Consecutive failed refreshes across every process serving the instance.
    pub refresh_attempts: u32,
    /// Client credentials for the direct provider exchange.
    pub client: Option<ClientCredentials>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Record for an instance that has started but not finished authorization.
    pub fn pending(owner_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            provider: provider.into(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            status: CredentialStatus::Pending,
            scopes: Vec::new(),
            refresh_attempts: 0,
            client: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_client(mut self, client: ClientCredentials) -> Self {
        self.client = Some(client);
        self
    }

    /// Apply a token update in place.
    pub fn apply(&mut self, update: TokenRecordUpdate) {
        self.access_token = update.access_token;
        self.refresh_token = update.refresh_token;
        self.expires_at = update.expires_at;
        self.status = update.status;
        self.scopes = update.scopes;
        self.refresh_attempts = update.refresh_attempts;
        self.updated_at = Utc::now();
    }
}

/// Mutable token fields written back to the durable store.
#[derive(Clone, Debug)]
pub struct TokenRecordUpdate {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    pub scopes: Vec<String>,
    pub refresh_attempts: u32,
}

impl TokenRecordUpdate {
    /// Snapshot of the token fields of a cached entry.
    pub fn from_entry(entry: &CredentialEntry) -> Self {
        Self {
            access_token: entry.access_token.clone(),
            refresh_token: entry.refresh_token.clone(),
            expires_at: entry.expires_at,
            status: entry.status,
            scopes: entry.scopes.clone(),
            refresh_attempts: entry.refresh_attempts,
        }
    }

    /// Update with every secret removed.
    pub fn cleared(status: CredentialStatus, scopes: Vec<String>) -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            expires_at: None,
            status,
            scopes,
            refresh_attempts: 0,
        }
    }
}
