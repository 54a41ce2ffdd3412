//! Credential Entry Types
//!
//! The cached per-instance credential entry and its partial updates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::{AccessToken, ClientCredentials, TokenRecord};

/// Lifecycle status of a credential entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Authorization started, no tokens yet.
    Pending,
    /// Tokens present and believed valid.
    Active,
    /// A refresh is in flight.
    Refreshing,
    /// The last refresh failed transiently; retried on next access.
    Failed,
    /// The user has to authorize again.
    RequiresReauth,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
            Self::RequiresReauth => "requires_reauth",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached credentials for one service instance.
#[derive(Clone, Debug)]
pub struct CredentialEntry {
    /// Primary key.
    pub instance_id: String,
    /// Tenant/user; never used as a cache key.
    pub owner_id: String,
    /// Provider the instance connects to.
    pub provider: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub client: Option<ClientCredentials>,
    pub status: CredentialStatus,
    /// Consecutive failed refreshes.
    pub refresh_attempts: u32,
    pub cached_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Store-assigned, bumped by every mutation.
    pub revision: u64,
}

impl CredentialEntry {
    /// Entry for an instance awaiting its first authorization.
    pub fn pending(
        instance_id: impl Into<String>,
        owner_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            owner_id: owner_id.into(),
            provider: provider.into(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            client: None,
            status: CredentialStatus::Pending,
            refresh_attempts: 0,
            cached_at: now,
            last_modified_at: now,
            last_used_at: now,
            last_refreshed_at: None,
            last_synced_at: None,
            revision: 0,
        }
    }

    /// Build a cache entry from the durable record.
    pub fn from_record(instance_id: impl Into<String>, record: &TokenRecord) -> Self {
        let mut entry = Self::pending(instance_id, record.owner_id.clone(), record.provider.clone());
        entry.access_token = record.access_token.clone();
        entry.refresh_token = record.refresh_token.clone();
        entry.expires_at = record.expires_at;
        entry.scopes = record.scopes.clone();
        entry.client = record.client.clone();
        entry.status = record.status;
        entry.refresh_attempts = record.refresh_attempts;
        entry.last_synced_at = Some(entry.cached_at);
        entry
    }

    /// Whether the cached access token can be served without a refresh.
    pub fn is_usable(&self, safety_buffer: Duration) -> bool {
        if self.status != CredentialStatus::Active || self.access_token.is_none() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => Utc::now() + to_chrono(safety_buffer) < expires_at,
            None => true,
        }
    }

    /// Check if the access token is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Not yet expired, but inside `window` of expiry.
    pub fn is_near_expiry(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at
            .map(|exp| exp > now && exp <= now + to_chrono(window))
            .unwrap_or(false)
    }

    pub fn has_tokens(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some()
    }

    /// Access token handed to callers.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.access_token
            .as_ref()
            .map(|value| AccessToken::new(value.clone(), self.expires_at, self.scopes.clone()))
    }

    /// Whether the token fields agree with the durable record.
    pub fn matches_record(&self, record: &TokenRecord) -> bool {
        self.status == record.status
            && self.refresh_attempts == record.refresh_attempts
            && secrets_match(&self.access_token, &record.access_token)
            && secrets_match(&self.refresh_token, &record.refresh_token)
            && timestamps_match(self.expires_at, record.expires_at)
    }

    /// Replace cached fields with the durable record's values.
    pub fn overwrite_from_record(&mut self, record: &TokenRecord, now: DateTime<Utc>) {
        self.owner_id = record.owner_id.clone();
        self.provider = record.provider.clone();
        self.access_token = record.access_token.clone();
        self.refresh_token = record.refresh_token.clone();
        self.expires_at = record.expires_at;
        self.scopes = record.scopes.clone();
        self.client = record.client.clone();
        self.status = record.status;
        self.refresh_attempts = record.refresh_attempts;
        self.last_modified_at = now;
        self.last_synced_at = Some(now);
    }
}

fn secrets_match(a: &Option<SecretString>, b: &Option<SecretString>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
        (None, None) => true,
        _ => false,
    }
}

// Durable stores commonly truncate timestamps; sub-second drift is not a change.
fn timestamps_match(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_milliseconds().abs() < 1000,
        (None, None) => true,
        _ => false,
    }
}

pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// New token values for an entry.
#[derive(Clone, Debug, Default)]
pub struct TokenUpdate {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<Vec<String>>,
}

impl TokenUpdate {
    /// Update removing both secrets.
    pub fn cleared() -> Self {
        Self::default()
    }
}

/// Partial update applied by `EntryStore::update_metadata`.
#[derive(Clone, Debug, Default)]
pub struct EntryUpdate {
    pub status: Option<CredentialStatus>,
    pub tokens: Option<TokenUpdate>,
    pub refresh_attempts: Option<u32>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl EntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: CredentialStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tokens(mut self, tokens: TokenUpdate) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn refresh_attempts(mut self, attempts: u32) -> Self {
        self.refresh_attempts = Some(attempts);
        self
    }

    pub fn last_refreshed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_refreshed_at = Some(at);
        self
    }

    /// Apply to an entry. Returns false when nothing changed.
    ///
    /// `refresh_attempts` only moves backward to 0, and only together with
    /// a token update.
    pub(crate) fn apply_to(self, entry: &mut CredentialEntry) -> bool {
        let mut changed = false;

        if let Some(attempts) = self.refresh_attempts {
            let allowed = attempts >= entry.refresh_attempts
                || (attempts == 0 && self.tokens.is_some());
            if allowed && attempts != entry.refresh_attempts {
                entry.refresh_attempts = attempts;
                changed = true;
            }
        }

        if let Some(tokens) = self.tokens {
            entry.access_token = tokens.access_token;
            entry.refresh_token = tokens.refresh_token;
            entry.expires_at = tokens.expires_at;
            if let Some(scopes) = tokens.scopes {
                entry.scopes = scopes;
            }
            changed = true;
        }

        if let Some(status) = self.status {
            changed |= entry.status != status;
            entry.status = status;
        }

        if let Some(at) = self.last_refreshed_at {
            entry.last_refreshed_at = Some(at);
            changed = true;
        }

        changed
    }
}
