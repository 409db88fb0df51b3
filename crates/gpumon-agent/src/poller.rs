//! Per-device polling loop

use crate::isolation::{isolate, Isolated};
use crate::Result;
use gpumon_adapter_gpu::{DeviceHandle, GpuLibrary, PcieCounter};
use gpumon_metrics::gpu::PCIE_GROUP;
use gpumon_metrics::GpuMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Pause between the end of one iteration and the start of the next
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What happened during one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// The PCI-E group failed and was skipped for this iteration
    pub pcie_suppressed: bool,
}

/// Samples one device forever and writes the results into [`GpuMetrics`].
///
/// Utilization and memory are required: any failure ends the poller with an
/// error. PCI-E throughput is optional: a failure skips the remaining PCI-E
/// reads for that iteration, bumps the failure counter, and the next
/// iteration tries again.
pub struct DevicePoller {
    index: u32,
    library: Arc<dyn GpuLibrary>,
    metrics: GpuMetrics,
    interval: Duration,
}

impl DevicePoller {
    pub fn new(index: u32, library: Arc<dyn GpuLibrary>, metrics: GpuMetrics) -> Self {
        Self {
            index,
            library,
            metrics,
            interval: POLL_INTERVAL,
        }
    }

    /// Override the pause between iterations
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Resolve the device handle. Called once per poller.
    pub async fn resolve(&self) -> Result<DeviceHandle> {
        let handle = self.library.device_handle(self.index).await?;
        info!("Polling GPU {} every {:?}", self.index, self.interval);
        Ok(handle)
    }

    /// Run one iteration: utilization, memory, then PCI-E
    pub async fn poll_once(&self, handle: &DeviceHandle) -> Result<PollOutcome> {
        let rates = self.library.utilization_rates(handle).await?;
        self.metrics.record_utilization(self.index, &rates)?;

        let memory = self.library.memory_info(handle).await?;
        self.metrics.record_memory(self.index, &memory)?;

        // Reads that succeeded before a failure are still exported
        let mut readings = Vec::with_capacity(PcieCounter::ALL.len());
        let outcome = isolate(self.read_pcie(handle, &mut readings)).await;
        for (counter, value) in readings {
            self.metrics.record_pcie(self.index, counter, value)?;
        }

        if let Isolated::Suppressed(reason) = &outcome {
            debug!("Skipping PCI-E throughput for GPU {}: {}", self.index, reason);
            self.metrics.record_optional_failure(self.index, PCIE_GROUP)?;
        }

        trace!(
            "GPU {}: gpu={}% mem={}% used={}B",
            self.index,
            rates.gpu,
            rates.memory,
            memory.used
        );

        Ok(PollOutcome {
            pcie_suppressed: outcome.is_suppressed(),
        })
    }

    async fn read_pcie(
        &self,
        handle: &DeviceHandle,
        readings: &mut Vec<(PcieCounter, u32)>,
    ) -> gpumon_adapter_gpu::Result<()> {
        for counter in PcieCounter::ALL {
            let value = self.library.pcie_throughput(handle, counter).await?;
            readings.push((counter, value));
        }
        Ok(())
    }

    /// Resolve the handle and poll until a required query fails
    pub async fn run(self) -> Result<()> {
        let handle = self.resolve().await?;

        loop {
            self.poll_once(&handle).await?;
            tokio::time::sleep(self.interval).await;
        }
    }
}
