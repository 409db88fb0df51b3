//! GPU metric families written by the per-device pollers

use crate::registry::{CounterFamily, GaugeFamily, MetricsRegistry};
use crate::Result;
use gpumon_adapter_gpu::{MemoryInfo, PcieCounter, UtilizationRates};
use serde::{Deserialize, Serialize};

pub const UTILIZATION_RATES: &str = "utilization_rates";
pub const MEMORY_INFO: &str = "memory_info";
pub const PCIE_THROUGHPUT: &str = "pcie_throughput";
pub const OPTIONAL_METRIC_FAILURES: &str = "optional_metric_failures_total";

/// Label group name for the PCI-E throughput reads
pub const PCIE_GROUP: &str = "pcie_throughput";

/// Whether device identity is part of every label set.
///
/// `Global` drops the `device_id` label, so all devices share one series
/// per type and the last device to poll wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelScheme {
    #[default]
    PerDevice,
    Global,
}

impl LabelScheme {
    fn schema(self, sub_label: &'static str) -> Vec<&'static str> {
        match self {
            LabelScheme::PerDevice => vec!["device_id", sub_label],
            LabelScheme::Global => vec![sub_label],
        }
    }
}

/// The gauge families exported for every device
#[derive(Debug, Clone)]
pub struct GpuMetrics {
    scheme: LabelScheme,

    /// GPU and memory-controller busy percent (`type` = gpu | memory)
    pub utilization_rates: GaugeFamily,

    /// Device memory in bytes (`type` = used | freed | total)
    pub memory_info: GaugeFamily,

    /// PCI-E throughput (`type` = tx | rx | count)
    pub pcie_throughput: GaugeFamily,

    /// Suppressed failures of optional metric groups
    pub optional_failures: CounterFamily,
}

impl GpuMetrics {
    /// Declare all GPU families on `registry`
    pub fn declare(registry: &MetricsRegistry, scheme: LabelScheme) -> Result<Self> {
        Ok(Self {
            scheme,
            utilization_rates: registry.declare_gauge(
                UTILIZATION_RATES,
                "GPU and memory controller utilization in percent",
                &scheme.schema("type"),
            )?,
            memory_info: registry.declare_gauge(
                MEMORY_INFO,
                "GPU memory used, free and total in bytes",
                &scheme.schema("type"),
            )?,
            pcie_throughput: registry.declare_gauge(
                PCIE_THROUGHPUT,
                "PCI-E throughput as reported by the management library",
                &scheme.schema("type"),
            )?,
            optional_failures: registry.declare_counter(
                OPTIONAL_METRIC_FAILURES,
                "Suppressed failures of optional metric groups",
                &scheme.schema("group"),
            )?,
        })
    }

    /// Label values for `device` and a sub-type, in schema order
    pub fn label_values<'a>(&self, device: &'a str, sub: &'a str) -> Vec<&'a str> {
        match self.scheme {
            LabelScheme::PerDevice => vec![device, sub],
            LabelScheme::Global => vec![sub],
        }
    }

    /// Record a utilization sample for device `index`
    pub fn record_utilization(&self, index: u32, rates: &UtilizationRates) -> Result<()> {
        let device = index.to_string();
        self.utilization_rates
            .set(&self.label_values(&device, "gpu"), rates.gpu as f64)?;
        self.utilization_rates
            .set(&self.label_values(&device, "memory"), rates.memory as f64)
    }

    /// Record a memory sample for device `index`
    pub fn record_memory(&self, index: u32, info: &MemoryInfo) -> Result<()> {
        let device = index.to_string();
        self.memory_info
            .set(&self.label_values(&device, "used"), info.used as f64)?;
        self.memory_info
            .set(&self.label_values(&device, "freed"), info.free as f64)?;
        self.memory_info
            .set(&self.label_values(&device, "total"), info.total as f64)
    }

    /// Record one PCI-E counter for device `index`
    pub fn record_pcie(&self, index: u32, counter: PcieCounter, value: u32) -> Result<()> {
        let device = index.to_string();
        self.pcie_throughput
            .set(&self.label_values(&device, counter.label()), value as f64)
    }

    /// Count one suppressed failure of `group` on device `index`
    pub fn record_optional_failure(&self, index: u32, group: &str) -> Result<()> {
        let device = index.to_string();
        self.optional_failures.inc(&self.label_values(&device, group))
    }
}
