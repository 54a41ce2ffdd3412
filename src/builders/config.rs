//! Configuration Builder
//!
//! Fluent builders for coordinator configuration and per-instance client
//! credentials.

use std::time::Duration;

use crate::error::{ConfigurationError, CredentialError};
use crate::resilience::RetryConfig;
use crate::types::{
    ClientAuthMethod, ClientCredentials, CoordinatorConfig, RenewalServiceConfig,
};
use secrecy::SecretString;

fn invalid(message: impl Into<String>) -> CredentialError {
    CredentialError::Configuration(ConfigurationError::InvalidConfig {
        message: message.into(),
    })
}

fn validate_endpoint(endpoint: &str) -> Result<(), CredentialError> {
    let parsed = url::Url::parse(endpoint).map_err(|_| {
        CredentialError::Configuration(ConfigurationError::InvalidEndpoint {
            url: endpoint.to_string(),
        })
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CredentialError::Configuration(
            ConfigurationError::InvalidEndpoint {
                url: endpoint.to_string(),
            },
        ));
    }
    Ok(())
}

/// Coordinator configuration builder.
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
    renewal_endpoint: Option<String>,
    service_key: Option<SecretString>,
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorConfigBuilder {
    /// Create builder starting from the defaults.
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            renewal_endpoint: None,
            service_key: None,
        }
    }

    /// Time before expiry at which a token stops being served.
    pub fn safety_buffer(mut self, buffer: Duration) -> Self {
        self.config.safety_buffer = buffer;
        self
    }

    /// Window reported as near expiry by statistics.
    pub fn near_expiry_window(mut self, window: Duration) -> Self {
        self.config.near_expiry_window = window;
        self
    }

    /// Consecutive failed refreshes before re-authorization is required.
    pub fn max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.config.max_refresh_attempts = attempts;
        self
    }

    /// Total budget for one refresh.
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.config.refresh_timeout = timeout;
        self
    }

    /// Lifetime assumed when a response has no `expires_in`.
    pub fn default_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.default_token_lifetime = lifetime;
        self
    }

    /// Set retry configuration.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set per-request HTTP timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    /// Primary internal renewal service endpoint.
    pub fn renewal_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.renewal_endpoint = Some(endpoint.into());
        self
    }

    /// Bearer key for the renewal service.
    pub fn renewal_service_key(mut self, key: impl Into<String>) -> Self {
        self.service_key = Some(SecretString::new(key.into()));
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile.interval = interval;
        self
    }

    pub fn reconcile_initial_delay(mut self, delay: Duration) -> Self {
        self.config.reconcile.initial_delay = delay;
        self
    }

    /// Idle time after which an entry is evicted.
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.config.reconcile.staleness_threshold = threshold;
        self
    }

    pub fn reconcile_concurrency(mut self, concurrency: usize) -> Self {
        self.config.reconcile.concurrency = concurrency;
        self
    }

    /// Load all active instances on init.
    pub fn preload_on_init(mut self, preload: bool) -> Self {
        self.config.preload_on_init = preload;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<CoordinatorConfig, CredentialError> {
        let mut config = self.config;

        if config.max_refresh_attempts == 0 {
            return Err(invalid("max_refresh_attempts must be at least 1"));
        }
        if config.reconcile.concurrency == 0 {
            return Err(invalid("reconcile_concurrency must be at least 1"));
        }
        if config.reconcile.interval.is_zero() {
            return Err(invalid("reconcile_interval must be non-zero"));
        }
        if config.refresh_timeout.is_zero() {
            return Err(invalid("refresh_timeout must be non-zero"));
        }
        if config.safety_buffer >= config.default_token_lifetime {
            return Err(invalid(
                "safety_buffer must be shorter than default_token_lifetime",
            ));
        }

        let retry = &config.retry;
        if retry.multiplier < 1.0 {
            return Err(invalid("retry multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(invalid("retry jitter must be between 0.0 and 1.0"));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(invalid("retry initial_delay exceeds max_delay"));
        }

        match (self.renewal_endpoint, self.service_key) {
            (Some(endpoint), service_key) => {
                validate_endpoint(&endpoint)?;
                config.renewal_service = Some(RenewalServiceConfig {
                    endpoint,
                    service_key,
                });
            }
            (None, Some(_)) => {
                return Err(CredentialError::Configuration(
                    ConfigurationError::MissingRequired {
                        field: "renewal_endpoint".to_string(),
                    },
                ))
            }
            (None, None) => {}
        }

        Ok(config)
    }
}

/// Create a new coordinator configuration builder.
pub fn credential_config() -> CoordinatorConfigBuilder {
    CoordinatorConfigBuilder::new()
}

/// Client credentials builder.
pub struct ClientCredentialsBuilder {
    client_id: String,
    client_secret: Option<SecretString>,
    token_endpoint: Option<String>,
    auth_method: ClientAuthMethod,
}

impl ClientCredentialsBuilder {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            token_endpoint: None,
            auth_method: ClientAuthMethod::default(),
        }
    }

    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(secret.into()));
        self
    }

    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    pub fn auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    pub fn build(self) -> Result<ClientCredentials, CredentialError> {
        if self.client_id.is_empty() {
            return Err(CredentialError::Configuration(
                ConfigurationError::MissingRequired {
                    field: "client_id".to_string(),
                },
            ));
        }

        let token_endpoint = self.token_endpoint.ok_or_else(|| {
            CredentialError::Configuration(ConfigurationError::MissingRequired {
                field: "token_endpoint".to_string(),
            })
        })?;
        validate_endpoint(&token_endpoint)?;

        if self.auth_method != ClientAuthMethod::None && self.client_secret.is_none() {
            return Err(CredentialError::Configuration(
                ConfigurationError::MissingRequired {
                    field: "client_secret".to_string(),
                },
            ));
        }

        Ok(ClientCredentials {
            client_id: self.client_id,
            client_secret: self.client_secret,
            token_endpoint,
            auth_method: self.auth_method,
        })
    }
}

/// Create a new client credentials builder.
pub fn client_credentials(client_id: impl Into<String>) -> ClientCredentialsBuilder {
    ClientCredentialsBuilder::new(client_id)
}
