//! Integration Credentials
//!
//! Process-local coordinator for OAuth credentials of integration instances.
//!
//! # Features
//!
//! - Sharded in-memory entry store with per-instance revisions
//! - Single-flight token refresh per instance
//! - Ordered renewal chain: internal renewal service, then the provider's
//!   token endpoint (RFC 6749 Section 6)
//! - Attempt ceiling that moves an instance to re-authorization
//! - Periodic reconciliation against the durable token store
//! - Authorization lifecycle (pending record, code exchange result)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use integrations_credentials::{credential_config, AccessFacade, InMemoryDurableAdapter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = credential_config()
//!         .renewal_endpoint("https://tokens.internal/renew")
//!         .renewal_service_key("service-key")
//!         .reconcile_interval(Duration::from_secs(300))
//!         .build()?;
//!
//!     let durable = Arc::new(InMemoryDurableAdapter::new());
//!     let facade = AccessFacade::init_with_http(config, durable).await?;
//!
//!     let header = facade.authorization_header("instance-1").await?;
//!     println!("Authorization: {}", header);
//!
//!     facade.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: entries, durable records, tokens and configuration
//! - `error`: error hierarchy from transport failures up to caller-facing errors
//! - `core`: HTTP transport
//! - `refresh`: renewal strategies and the executor running them in order
//! - `token`: entry store, per-instance locks, durable adapter, refresh coordinator
//! - `reconcile`: background reconciliation loop
//! - `resilience`: retry policy
//! - `telemetry`: metrics seam
//! - `builders`: fluent configuration builders
//! - `client`: access facade combining all of the above

pub mod builders;
pub mod client;
pub mod core;
pub mod error;
pub mod reconcile;
pub mod refresh;
pub mod resilience;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export main facade
pub use client::{AccessFacade, CredentialStatistics, InstanceStatistics};

// Re-export builders
pub use builders::{
    client_credentials, credential_config, ClientCredentialsBuilder, CoordinatorConfigBuilder,
};

// Re-export errors
pub use error::{
    create_error_from_response, get_user_message, map_token_error, parse_error_response,
    AccessError, AuthError, ConfigurationError, CredentialError, CredentialResult, FailureClass,
    NetworkError, OAuth2ErrorResponse, ProviderError, RefreshError, ResponseError, StorageError,
};

// Re-export types
pub use types::{
    // Config
    ClientAuthMethod, ClientCredentials, CoordinatorConfig, GrantType, ReconcileConfig,
    RenewalServiceConfig,
    // Entry
    CredentialEntry, CredentialStatus, EntryUpdate, TokenUpdate,
    // Durable record
    TokenRecord, TokenRecordUpdate,
    // Token
    AccessToken, RefreshedTokens, TokenResponse,
};

// Re-export core components
pub use core::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
};

// Re-export refresh
pub use refresh::{
    DirectProviderStrategy, MockTokenRefresher, PrimaryRenewalStrategy, RefreshExecutor,
    RefreshRequest, RenewalStrategy, TokenRefresher, DIRECT_PROVIDER_STRATEGY, PRIMARY_STRATEGY,
};

// Re-export token management
pub use token::{
    CacheStatistics, DurableAdapter, EntryStore, InMemoryDurableAdapter, InstanceLocks,
    MockDurableAdapter, RefreshCoordinator,
};

// Re-export reconciliation
pub use reconcile::{EvictionReason, ReconcileHandle, ReconcileReport, ReconciliationLoop};

// Re-export resilience
pub use resilience::{RetryConfig, RetryPolicy, DEFAULT_RETRY_CONFIG};

// Re-export telemetry
pub use telemetry::{
    create_in_memory_metrics, no_op_metrics, CredentialMetrics, InMemoryMetrics, MetricEntry,
    MetricLabels, NoOpMetrics,
};
