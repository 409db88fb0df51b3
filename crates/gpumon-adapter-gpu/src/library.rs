//! GPU management library capability

use crate::config::{GpuBackend, GpuLibraryConfig};
use crate::metrics::{MemoryInfo, PcieCounter, UtilizationRates};
use crate::{GpuError, Result};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait defining the hardware management capability used by the pollers.
///
/// Every call may fail with a library-defined status. Callers decide whether
/// a failure is fatal; implementations only report it.
#[async_trait]
pub trait GpuLibrary: Send + Sync {
    /// Acquire the library. Must succeed before any other call.
    async fn initialize(&self) -> Result<()>;

    /// Release the library. Handles resolved earlier become unusable.
    async fn shutdown(&self) -> Result<()>;

    /// Number of devices visible to the library
    async fn device_count(&self) -> Result<u32>;

    /// Resolve the device at `index` in `[0, device_count)` to a handle
    async fn device_handle(&self, index: u32) -> Result<DeviceHandle>;

    /// GPU and memory-controller busy percentages
    async fn utilization_rates(&self, handle: &DeviceHandle) -> Result<UtilizationRates>;

    /// Used, free and total device memory in bytes
    async fn memory_info(&self, handle: &DeviceHandle) -> Result<MemoryInfo>;

    /// PCI-E throughput for the selected counter
    async fn pcie_throughput(&self, handle: &DeviceHandle, counter: PcieCounter) -> Result<u32>;

    /// Backend name, used in logs
    fn name(&self) -> &'static str;
}

/// Opaque reference to one physical device.
///
/// Obtained once from [`GpuLibrary::device_handle`] and reused for every
/// query against that device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    index: u32,
    raw: RawHandle,
}

/// Backend-specific part of a [`DeviceHandle`]
#[derive(Debug, Clone, Copy)]
pub(crate) enum RawHandle {
    #[cfg(any(feature = "mock", test))]
    Mock,
    /// NVML session the handle was resolved in
    #[cfg(feature = "nvml")]
    Nvml { generation: u64 },
}

impl DeviceHandle {
    pub(crate) fn new(index: u32, raw: RawHandle) -> Self {
        Self { index, raw }
    }

    /// Enumeration index of the device
    pub fn index(&self) -> u32 {
        self.index
    }

    #[allow(dead_code)]
    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }
}

/// Create a backend-specific GPU library
pub fn create_library(config: &GpuLibraryConfig) -> Result<Arc<dyn GpuLibrary>> {
    config.validate().map_err(GpuError::Configuration)?;

    info!("Creating GPU library for backend: {}", config.backend);

    match config.backend {
        #[cfg(feature = "nvml")]
        GpuBackend::Nvml => Ok(Arc::new(crate::nvml::NvmlLibrary::new())),

        #[cfg(any(feature = "mock", test))]
        GpuBackend::Mock => Ok(Arc::new(crate::mock::MockGpuLibrary::new(
            config.mock_device_count,
        ))),

        #[allow(unreachable_patterns)]
        backend => {
            warn!("GPU backend {} not supported or feature not enabled", backend);
            Err(GpuError::UnsupportedBackend(backend.to_string()))
        }
    }
}
