//! Resilience
//!
//! Retry with exponential backoff and jitter, shared by every renewal strategy.

pub mod retry;

pub use retry::{RetryConfig, RetryPolicy, DEFAULT_RETRY_CONFIG};
