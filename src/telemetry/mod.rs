//! Telemetry
//!
//! Observability components for the credential coordinator.
//!
//! Logging goes through `tracing` macros at the call sites; this module
//! provides the metrics seam.

pub mod metrics;

pub use metrics::{
    create_in_memory_metrics, no_op_metrics, CredentialMetrics, InMemoryMetrics, MetricEntry,
    MetricLabels, NoOpMetrics,
};
