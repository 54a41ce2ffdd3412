//! Configuration Types
//!
//! Coordinator, renewal-path and reconciliation configuration.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::RetryConfig;

/// Top-level configuration for the credential coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// A cached token is only served while `now < expires_at - safety_buffer`.
    pub safety_buffer: Duration,
    /// Window reported as "near expiry" by statistics.
    pub near_expiry_window: Duration,
    /// Consecutive failed refreshes before an instance needs re-authentication.
    pub max_refresh_attempts: u32,
    /// Total budget for one refresh, retries and fallbacks included.
    pub refresh_timeout: Duration,
    /// Lifetime assumed when a token response carries no `expires_in`.
    pub default_token_lifetime: Duration,
    /// Retry policy applied to every renewal strategy.
    pub retry: RetryConfig,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Primary internal renewal service; `None` goes straight to the provider.
    pub renewal_service: Option<RenewalServiceConfig>,
    /// Background reconciliation settings.
    pub reconcile: ReconcileConfig,
    /// Load every active instance from the durable store on init.
    pub preload_on_init: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            safety_buffer: Duration::from_secs(DEFAULT_SAFETY_BUFFER_SECS),
            near_expiry_window: Duration::from_secs(15 * 60),
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            refresh_timeout: Duration::from_secs(30),
            default_token_lifetime: Duration::from_secs(3600),
            retry: RetryConfig::default(),
            http_timeout: Duration::from_secs(30),
            renewal_service: None,
            reconcile: ReconcileConfig::default(),
            preload_on_init: false,
        }
    }
}

/// Internal token-exchange service tried before the provider.
#[derive(Clone)]
pub struct RenewalServiceConfig {
    /// Endpoint receiving the renewal POST.
    pub endpoint: String,
    /// Service key sent as a bearer token, if the service requires one.
    pub service_key: Option<SecretString>,
}

impl std::fmt::Debug for RenewalServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalServiceConfig")
            .field("endpoint", &self.endpoint)
            .field("service_key", &self.service_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Reconciliation loop configuration.
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Time between runs.
    pub interval: Duration,
    /// Delay before the first run after start.
    pub initial_delay: Duration,
    /// Entries unused for longer than this are evicted.
    pub staleness_threshold: Duration,
    /// Concurrent durable reads per run.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            initial_delay: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(30 * 60),
            concurrency: 8,
        }
    }
}

/// Per-instance client credentials for the direct provider exchange.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Client identifier.
    pub client_id: String,
    /// Client secret (for confidential clients).
    pub client_secret: Option<SecretString>,
    /// Provider token endpoint.
    pub token_endpoint: String,
    /// Client authentication method.
    pub auth_method: ClientAuthMethod,
}

impl ClientCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Some(SecretString::new(client_secret.into())),
            token_endpoint: token_endpoint.into(),
            auth_method: ClientAuthMethod::ClientSecretPost,
        }
    }

    pub fn with_auth_method(mut self, auth_method: ClientAuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_endpoint", &self.token_endpoint)
            .field("auth_method", &self.auth_method)
            .finish()
    }
}

/// Client authentication method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// client_id and client_secret in request body.
    #[default]
    ClientSecretPost,
    /// HTTP Basic Authentication header.
    ClientSecretBasic,
    /// No client authentication (public client).
    None,
}

/// Grant type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantType {
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
    #[serde(rename = "refresh_token")]
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Default configuration values.
pub const DEFAULT_SAFETY_BUFFER_SECS: u64 = 300;
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.safety_buffer, Duration::from_secs(300));
        assert_eq!(config.max_refresh_attempts, 5);
        assert_eq!(config.reconcile.interval, Duration::from_secs(300));
        assert_eq!(config.reconcile.staleness_threshold, Duration::from_secs(1800));
        assert!(config.renewal_service.is_none());
    }

    #[test]
    fn test_client_credentials_debug_redacts_secret() {
        let client = ClientCredentials::new("client", "hunter2", "https://example.com/token");
        let debug = format!("{:?}", client);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
