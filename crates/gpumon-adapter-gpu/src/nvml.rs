//! NVML (NVIDIA Management Library) backend

use crate::library::{DeviceHandle, GpuLibrary, RawHandle};
use crate::metrics::{MemoryInfo, PcieCounter, UtilizationRates};
use crate::{GpuError, Result};

use async_trait::async_trait;
use nvml_wrapper::enum_wrappers::device::PcieUtilCounter;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Loaded NVML instance and the session it belongs to.
///
/// `generation` is bumped by every successful `initialize`, so handles
/// resolved before a shutdown are rejected after a later re-initialize.
#[derive(Default)]
struct NvmlState {
    nvml: Option<Nvml>,
    generation: u64,
}

impl NvmlState {
    fn nvml(&self) -> Result<&Nvml> {
        self.nvml
            .as_ref()
            .ok_or_else(|| GpuError::Unavailable("NVML is not initialized".to_string()))
    }
}

/// NVML GPU library
pub struct NvmlLibrary {
    state: RwLock<NvmlState>,
}

impl Default for NvmlLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmlLibrary {
    /// Create an NVML library; NVML itself is loaded by `initialize`
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NvmlState::default()),
        }
    }

    /// Run `f` against the device behind `handle`.
    ///
    /// The device is looked up by index in the session the handle was
    /// resolved in; a handle from an earlier session is unavailable.
    async fn with_device<T>(
        &self,
        operation: &str,
        handle: &DeviceHandle,
        f: impl FnOnce(&Device<'_>) -> std::result::Result<T, NvmlError>,
    ) -> Result<T> {
        let state = self.state.read().await;
        let index = handle.index();

        let generation = match handle.raw() {
            RawHandle::Nvml { generation } => generation,
            #[allow(unreachable_patterns)]
            _ => {
                return Err(GpuError::query(
                    operation,
                    index,
                    "handle was not resolved by NVML",
                ))
            }
        };

        if generation != state.generation {
            return Err(GpuError::Unavailable(format!(
                "handle for GPU {} was resolved before NVML was reinitialized",
                index
            )));
        }

        let device = state
            .nvml()?
            .device_by_index(index)
            .map_err(|e| map_query_error(operation, index, e))?;
        f(&device).map_err(|e| map_query_error(operation, index, e))
    }
}

fn map_query_error(operation: &str, index: u32, error: NvmlError) -> GpuError {
    match error {
        NvmlError::NotSupported => {
            GpuError::NotSupported(format!("{} on GPU {}", operation, index))
        }
        NvmlError::Uninitialized => GpuError::Unavailable(error.to_string()),
        other => GpuError::query(operation, index, other),
    }
}

#[async_trait]
impl GpuLibrary for NvmlLibrary {
    async fn initialize(&self) -> Result<()> {
        info!("Initializing NVML");

        let mut state = self.state.write().await;
        if state.nvml.is_some() {
            warn!("NVML already initialized");
            return Ok(());
        }

        let nvml = Nvml::init().map_err(|e| GpuError::InitializationFailed(e.to_string()))?;

        match nvml.sys_driver_version() {
            Ok(version) => info!("NVML initialized, driver version {}", version),
            Err(e) => debug!("NVML initialized, driver version unavailable: {}", e),
        }

        state.nvml = Some(nvml);
        state.generation += 1;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down NVML");

        match self.state.write().await.nvml.take() {
            Some(nvml) => nvml
                .shutdown()
                .map_err(|e| GpuError::ShutdownFailed(e.to_string())),
            None => Ok(()),
        }
    }

    async fn device_count(&self) -> Result<u32> {
        let state = self.state.read().await;

        state
            .nvml()?
            .device_count()
            .map_err(|e| GpuError::DeviceCount(e.to_string()))
    }

    async fn device_handle(&self, index: u32) -> Result<DeviceHandle> {
        let state = self.state.read().await;

        let device = state
            .nvml()?
            .device_by_index(index)
            .map_err(|e| GpuError::Resolution {
                index,
                reason: e.to_string(),
            })?;

        if let Ok(name) = device.name() {
            debug!("Resolved GPU {}: {}", index, name);
        }

        Ok(DeviceHandle::new(
            index,
            RawHandle::Nvml {
                generation: state.generation,
            },
        ))
    }

    async fn utilization_rates(&self, handle: &DeviceHandle) -> Result<UtilizationRates> {
        self.with_device("utilization_rates", handle, |device| {
            let rates = device.utilization_rates()?;
            Ok(UtilizationRates {
                gpu: rates.gpu,
                memory: rates.memory,
            })
        })
        .await
    }

    async fn memory_info(&self, handle: &DeviceHandle) -> Result<MemoryInfo> {
        self.with_device("memory_info", handle, |device| {
            let info = device.memory_info()?;
            Ok(MemoryInfo {
                used: info.used,
                free: info.free,
                total: info.total,
            })
        })
        .await
    }

    async fn pcie_throughput(&self, handle: &DeviceHandle, counter: PcieCounter) -> Result<u32> {
        let operation = format!("pcie_throughput({})", counter);

        // NVML only exposes send and receive; there is no counter-count
        // selector.
        let util_counter = match counter {
            PcieCounter::Tx => PcieUtilCounter::Send,
            PcieCounter::Rx => PcieUtilCounter::Receive,
            PcieCounter::Count => {
                return Err(GpuError::NotSupported(format!(
                    "{} on GPU {}",
                    operation,
                    handle.index()
                )))
            }
        };

        self.with_device(&operation, handle, |device| {
            device.pcie_throughput(util_counter)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queries_before_initialize() {
        let library = NvmlLibrary::new();
        assert!(matches!(
            library.device_count().await,
            Err(GpuError::Unavailable(_))
        ));
        assert!(matches!(
            library.device_handle(0).await,
            Err(GpuError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize() {
        let library = NvmlLibrary::new();
        assert!(library.shutdown().await.is_ok());
        assert_eq!(library.name(), "nvml");
    }

    #[tokio::test]
    async fn test_count_selector_rejected() {
        let library = NvmlLibrary::new();
        let handle = DeviceHandle::new(0, RawHandle::Nvml { generation: 0 });
        let err = library
            .pcie_throughput(&handle, PcieCounter::Count)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GpuError::NotSupported("pcie_throughput(count) on GPU 0".to_string())
        );
    }

    #[tokio::test]
    async fn test_handle_from_earlier_session_rejected() {
        let library = NvmlLibrary::new();
        let stale = DeviceHandle::new(1, RawHandle::Nvml { generation: 3 });

        let err = library.utilization_rates(&stale).await.unwrap_err();
        assert_eq!(
            err,
            GpuError::Unavailable(
                "handle for GPU 1 was resolved before NVML was reinitialized".to_string()
            )
        );

        // Same session, but NVML is not loaded
        let current = DeviceHandle::new(1, RawHandle::Nvml { generation: 0 });
        let err = library.memory_info(&current).await.unwrap_err();
        assert_eq!(err, GpuError::Unavailable("NVML is not initialized".to_string()));
    }

    #[tokio::test]
    async fn test_mock_handle_rejected() {
        let library = NvmlLibrary::new();
        let handle = DeviceHandle::new(0, RawHandle::Mock);
        let err = library.utilization_rates(&handle).await.unwrap_err();
        assert!(matches!(err, GpuError::Query { index: 0, .. }));
    }

    #[test]
    fn test_not_supported_mapping() {
        let err = map_query_error("pcie_throughput(tx)", 1, NvmlError::NotSupported);
        assert_eq!(err, GpuError::NotSupported("pcie_throughput(tx) on GPU 1".to_string()));
    }
}
