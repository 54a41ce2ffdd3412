//! Core Components
//!
//! HTTP transport shared by the renewal strategies.

pub mod transport;

pub use transport::*;
