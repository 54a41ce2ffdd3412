//! Token Refresh
//!
//! Ordered renewal strategies and the executor that runs them.

pub mod executor;
pub mod strategy;

pub use executor::{MockTokenRefresher, RefreshExecutor, TokenRefresher};
pub use strategy::{
    parse_token_response, DirectProviderStrategy, PrimaryRenewalStrategy, RefreshRequest,
    RenewalStrategy, DIRECT_PROVIDER_STRATEGY, PRIMARY_STRATEGY,
};
