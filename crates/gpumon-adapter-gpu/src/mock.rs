//! Mock GPU library for testing

use crate::library::{DeviceHandle, GpuLibrary, RawHandle};
use crate::metrics::{MemoryInfo, PcieCounter, UtilizationRates};
use crate::{GpuError, Result};

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;

/// Scripted state of one simulated device
#[derive(Debug, Clone)]
struct MockDevice {
    utilization: UtilizationRates,
    memory: MemoryInfo,
    pcie: [u32; 3],
    fail_resolution: bool,
    fail_utilization: bool,
    fail_memory: bool,
    fail_pcie: Option<PcieCounter>,
    panic_pcie: bool,
    resolutions: u64,
    utilization_queries: u64,
    pcie_attempts: u64,
}

impl MockDevice {
    fn new(index: u32) -> Self {
        let i = index as u64;
        Self {
            utilization: UtilizationRates {
                gpu: 10 + (index * 15) % 80,
                memory: 5 + (index * 10) % 60,
            },
            memory: MemoryInfo::from_used(2 * GIB + i * 512 * 1024 * 1024, 8 * GIB),
            pcie: [1000 * (index + 1), 2000 * (index + 1), 2],
            fail_resolution: false,
            fail_utilization: false,
            fail_memory: false,
            fail_pcie: None,
            panic_pcie: false,
            resolutions: 0,
            utilization_queries: 0,
            pcie_attempts: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    initialized: bool,
    shut_down: bool,
    fail_initialize: bool,
    fail_device_count: bool,
    fail_shutdown: bool,
    devices: Vec<MockDevice>,
}

/// Mock GPU library with per-device scripted values and failure injection
#[derive(Debug)]
pub struct MockGpuLibrary {
    state: Mutex<MockState>,
}

impl MockGpuLibrary {
    /// Create a mock library exposing `device_count` devices
    pub fn new(device_count: u32) -> Self {
        info!("Creating mock GPU library with {} devices", device_count);

        let state = MockState {
            devices: (0..device_count).map(MockDevice::new).collect(),
            ..Default::default()
        };

        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_device<R>(&self, index: u32, f: impl FnOnce(&mut MockDevice) -> R) -> R {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(index as usize)
            .unwrap_or_else(|| panic!("mock device {} does not exist", index));
        f(device)
    }

    /// Script the utilization rates reported for a device
    pub fn set_utilization(&self, index: u32, gpu: u32, memory: u32) {
        self.with_device(index, |d| d.utilization = UtilizationRates { gpu, memory });
    }

    /// Script the memory info reported for a device
    pub fn set_memory(&self, index: u32, used: u64, total: u64) {
        self.with_device(index, |d| d.memory = MemoryInfo::from_used(used, total));
    }

    /// Script the PCI-E counters reported for a device
    pub fn set_pcie(&self, index: u32, tx: u32, rx: u32, count: u32) {
        self.with_device(index, |d| d.pcie = [tx, rx, count]);
    }

    /// Make handle resolution fail for a device
    pub fn fail_resolution(&self, index: u32, fail: bool) {
        self.with_device(index, |d| d.fail_resolution = fail);
    }

    /// Make utilization queries fail for a device
    pub fn fail_utilization(&self, index: u32, fail: bool) {
        self.with_device(index, |d| d.fail_utilization = fail);
    }

    /// Make memory queries fail for a device
    pub fn fail_memory(&self, index: u32, fail: bool) {
        self.with_device(index, |d| d.fail_memory = fail);
    }

    /// Make the given PCI-E counter fail for a device; `None` clears it
    pub fn fail_pcie(&self, index: u32, counter: Option<PcieCounter>) {
        self.with_device(index, |d| d.fail_pcie = counter);
    }

    /// Make PCI-E queries panic for a device
    pub fn panic_pcie(&self, index: u32, panic: bool) {
        self.with_device(index, |d| d.panic_pcie = panic);
    }

    /// Make `initialize` fail
    pub fn fail_initialize(&self, fail: bool) {
        self.state().fail_initialize = fail;
    }

    /// Make `device_count` fail
    pub fn fail_device_count(&self, fail: bool) {
        self.state().fail_device_count = fail;
    }

    /// Make `shutdown` fail
    pub fn fail_shutdown(&self, fail: bool) {
        self.state().fail_shutdown = fail;
    }

    /// Number of handle resolutions for a device
    pub fn resolutions(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.resolutions)
    }

    /// Number of utilization queries for a device
    pub fn utilization_queries(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.utilization_queries)
    }

    /// Number of PCI-E queries for a device, failed ones included
    pub fn pcie_attempts(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.pcie_attempts)
    }

    /// Whether `initialize` has succeeded
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Whether `shutdown` has been called successfully
    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    fn check_available(state: &MockState) -> Result<()> {
        if !state.initialized {
            return Err(GpuError::Unavailable("mock library not initialized".to_string()));
        }
        if state.shut_down {
            return Err(GpuError::Unavailable("mock library shut down".to_string()));
        }
        Ok(())
    }

    fn device_for_query<'a>(
        state: &'a mut MockState,
        operation: &str,
        handle: &DeviceHandle,
    ) -> Result<&'a mut MockDevice> {
        Self::check_available(state)?;
        let index = handle.index();
        state
            .devices
            .get_mut(index as usize)
            .ok_or_else(|| GpuError::query(operation, index, "invalid device handle"))
    }
}

#[async_trait]
impl GpuLibrary for MockGpuLibrary {
    async fn initialize(&self) -> Result<()> {
        let mut state = self.state();
        if state.fail_initialize {
            return Err(GpuError::InitializationFailed(
                "driver not loaded (simulated)".to_string(),
            ));
        }
        state.initialized = true;
        state.shut_down = false;
        debug!("Mock GPU library initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state();
        if state.fail_shutdown {
            return Err(GpuError::ShutdownFailed("simulated shutdown failure".to_string()));
        }
        state.shut_down = true;
        debug!("Mock GPU library shut down");
        Ok(())
    }

    async fn device_count(&self) -> Result<u32> {
        let state = self.state();
        Self::check_available(&state)?;
        if state.fail_device_count {
            return Err(GpuError::DeviceCount("simulated device count failure".to_string()));
        }
        Ok(state.devices.len() as u32)
    }

    async fn device_handle(&self, index: u32) -> Result<DeviceHandle> {
        let mut state = self.state();
        Self::check_available(&state)?;
        let device = state.devices.get_mut(index as usize).ok_or_else(|| GpuError::Resolution {
            index,
            reason: "invalid argument".to_string(),
        })?;
        device.resolutions += 1;
        if device.fail_resolution {
            return Err(GpuError::Resolution {
                index,
                reason: "simulated resolution failure".to_string(),
            });
        }
        Ok(DeviceHandle::new(index, RawHandle::Mock))
    }

    async fn utilization_rates(&self, handle: &DeviceHandle) -> Result<UtilizationRates> {
        let mut state = self.state();
        let device = Self::device_for_query(&mut state, "utilization_rates", handle)?;
        device.utilization_queries += 1;
        if device.fail_utilization {
            return Err(GpuError::query("utilization_rates", handle.index(), "GPU is lost"));
        }
        Ok(device.utilization)
    }

    async fn memory_info(&self, handle: &DeviceHandle) -> Result<MemoryInfo> {
        let mut state = self.state();
        let device = Self::device_for_query(&mut state, "memory_info", handle)?;
        if device.fail_memory {
            return Err(GpuError::query("memory_info", handle.index(), "GPU is lost"));
        }
        Ok(device.memory)
    }

    async fn pcie_throughput(&self, handle: &DeviceHandle, counter: PcieCounter) -> Result<u32> {
        let operation = format!("pcie_throughput({})", counter);
        let (value, should_panic) = {
            let mut state = self.state();
            let device = Self::device_for_query(&mut state, &operation, handle)?;
            device.pcie_attempts += 1;
            if device.fail_pcie == Some(counter) {
                return Err(GpuError::NotSupported(format!(
                    "{} on GPU {}",
                    operation,
                    handle.index()
                )));
            }
            let value = match counter {
                PcieCounter::Tx => device.pcie[0],
                PcieCounter::Rx => device.pcie[1],
                PcieCounter::Count => device.pcie[2],
            };
            (value, device.panic_pcie)
        };
        // Lock released above so a panic leaves the mock usable
        if should_panic {
            panic!("simulated panic in {} for GPU {}", operation, handle.index());
        }
        Ok(value)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
