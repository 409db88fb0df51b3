//! GPU telemetry samples returned by a [`GpuLibrary`](crate::GpuLibrary)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Utilization over the driver's last sample period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UtilizationRates {
    /// Percent of time a kernel was executing on the GPU
    pub gpu: u32,

    /// Percent of time device memory was being read or written
    pub memory: u32,
}

/// Device memory usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Allocated memory
    pub used: u64,

    /// Unallocated memory
    pub free: u64,

    /// Installed memory
    pub total: u64,
}

impl MemoryInfo {
    /// Build a sample from used and total bytes
    pub fn from_used(used: u64, total: u64) -> Self {
        Self {
            used,
            free: total.saturating_sub(used),
            total,
        }
    }
}

/// PCI-E throughput counter selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcieCounter {
    /// Bytes sent by the device (KB/s)
    Tx,
    /// Bytes received by the device (KB/s)
    Rx,
    /// The library's counter-count selector
    Count,
}

impl PcieCounter {
    /// Counters in the order the poller reads them
    pub const ALL: [PcieCounter; 3] = [PcieCounter::Tx, PcieCounter::Rx, PcieCounter::Count];

    /// Label value used for this counter in exported metrics
    pub fn label(self) -> &'static str {
        match self {
            PcieCounter::Tx => "tx",
            PcieCounter::Rx => "rx",
            PcieCounter::Count => "count",
        }
    }
}

impl fmt::Display for PcieCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_from_used() {
        let info = MemoryInfo::from_used(2 << 30, 8 << 30);
        assert_eq!(info.free, 6 << 30);

        // Drivers can briefly report used > total while reclaiming
        let info = MemoryInfo::from_used(10, 8);
        assert_eq!(info.free, 0);
    }

    #[test]
    fn test_pcie_counter_labels() {
        let labels: Vec<_> = PcieCounter::ALL.iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["tx", "rx", "count"]);
        assert_eq!(PcieCounter::Rx.to_string(), "rx");
    }
}
