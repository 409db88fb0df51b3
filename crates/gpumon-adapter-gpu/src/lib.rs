//! # gpumon-adapter-gpu
//!
//! GPU management library adapters for gpumon.
//!
//! This crate provides:
//! - The [`GpuLibrary`] capability used by the per-device pollers
//! - Opaque [`DeviceHandle`]s resolved once per device
//! - Utilization, memory and PCI-E throughput samples
//! - Backend selection from configuration
//!
//! ## Supported Backends
//!
//! - **NVML**: NVIDIA Management Library via `nvml-wrapper` (feature `nvml`)
//! - **Mock**: scripted devices with failure injection (feature `mock`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use gpumon_adapter_gpu::{create_library, GpuBackend, GpuLibraryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let library = create_library(&GpuLibraryConfig::new(GpuBackend::Nvml))?;
//!     library.initialize().await?;
//!
//!     let count = library.device_count().await?;
//!     for index in 0..count {
//!         let handle = library.device_handle(index).await?;
//!         let rates = library.utilization_rates(&handle).await?;
//!         println!("GPU {}: {}% busy", index, rates.gpu);
//!     }
//!
//!     library.shutdown().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod config;
pub mod library;
pub mod metrics;

// Backend-specific modules
#[cfg(feature = "nvml")]
pub mod nvml;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use config::{GpuBackend, GpuLibraryConfig};
pub use library::{create_library, DeviceHandle, GpuLibrary};
pub use metrics::{MemoryInfo, PcieCounter, UtilizationRates};

/// Result type for GPU operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("GPU backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("GPU library initialization failed: {0}")]
    InitializationFailed(String),

    #[error("GPU library shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("Device count query failed: {0}")]
    DeviceCount(String),

    #[error("Failed to resolve handle for GPU {index}: {reason}")]
    Resolution { index: u32, reason: String },

    #[error("{operation} failed for GPU {index}: {reason}")]
    Query {
        operation: String,
        index: u32,
        reason: String,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("GPU library unavailable: {0}")]
    Unavailable(String),
}

impl GpuError {
    /// Build a query error for `operation` on device `index`
    pub fn query(operation: impl Into<String>, index: u32, reason: impl ToString) -> Self {
        GpuError::Query {
            operation: operation.into(),
            index,
            reason: reason.to_string(),
        }
    }
}
