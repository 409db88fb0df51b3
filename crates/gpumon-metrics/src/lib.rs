//! # gpumon-metrics
//!
//! Gauge registry and Prometheus exposition for gpumon.
//!
//! This crate provides:
//! - An explicitly constructed [`MetricsRegistry`] shared by handle
//! - Labeled gauge and counter families safe for concurrent writers
//! - The GPU metric families written by the per-device pollers
//! - A pull-based `/metrics` endpoint

pub mod endpoint;
pub mod gpu;
pub mod registry;

// Re-export commonly used types
pub use endpoint::{BoundEndpoint, MetricsEndpoint};
pub use gpu::{GpuMetrics, LabelScheme};
pub use registry::{CounterFamily, GaugeFamily, MetricsRegistry, MetricsRegistryBuilder};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
