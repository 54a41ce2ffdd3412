//! Builders
//!
//! Fluent builder patterns for coordinator configuration and client credentials.

pub mod config;

pub use config::{
    client_credentials, credential_config, ClientCredentialsBuilder, CoordinatorConfigBuilder,
};
