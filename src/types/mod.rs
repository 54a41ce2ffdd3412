//! Credential Types
//!
//! Core type definitions shared by the cache, the coordinator and the
//! renewal strategies.

pub mod config;
pub mod entry;
pub mod record;
pub mod token;

pub use config::*;
pub use entry::*;
pub use record::*;
pub use token::*;
