//! Token Management
//!
//! Credential cache, durable store seam and the refresh coordinator.
//!
//! This module provides:
//!
//! - **Entry Store**: In-memory, sharded cache of credential entries
//! - **Durable Adapter**: Interface to the canonical token store
//! - **Refresh Coordinator**: Single-flight refresh per instance

pub mod cache;
pub mod coordinator;
pub mod durable;
pub mod locks;

// Entry Store
pub use cache::{CacheStatistics, EntryStore};

// Durable Adapter
pub use durable::{DurableAdapter, InMemoryDurableAdapter, MockDurableAdapter};

// Refresh Coordinator
pub use coordinator::RefreshCoordinator;
pub use locks::InstanceLocks;
