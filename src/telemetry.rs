//! Prometheus metrics for every component.

pub mod registry;

pub use registry::Metrics;
