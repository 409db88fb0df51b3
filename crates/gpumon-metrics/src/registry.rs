//! Metrics registry holding every declared metric family

use crate::{MetricsError, Result};
use prometheus::core::Collector;
use prometheus::proto::Metric;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Central registry for declaring metric families and rendering them.
///
/// Cloning is cheap and every clone refers to the same families. The
/// underlying prometheus vectors synchronize internally, so concurrent
/// writers need no extra locking.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsRegistryInner>,
}

#[derive(Debug)]
struct MetricsRegistryInner {
    /// Prometheus registry all families are registered with
    registry: Registry,
}

impl MetricsRegistry {
    /// Create a registry without global labels
    pub fn new() -> Result<Self> {
        MetricsRegistryBuilder::new().build()
    }

    fn with_global_labels(global_labels: HashMap<String, String>) -> Result<Self> {
        let registry = if global_labels.is_empty() {
            Registry::new()
        } else {
            Registry::new_custom(None, Some(global_labels))
                .map_err(|e| MetricsError::Registry(format!("Invalid global labels: {}", e)))?
        };

        Ok(Self {
            inner: Arc::new(MetricsRegistryInner { registry }),
        })
    }

    /// Declare a gauge family with the given label schema
    pub fn declare_gauge(&self, name: &str, help: &str, labels: &[&str]) -> Result<GaugeFamily> {
        let vec = GaugeVec::new(Opts::new(name, help), labels)
            .map_err(|e| MetricsError::Registry(format!("Invalid gauge {}: {}", name, e)))?;
        self.register(name, Box::new(vec.clone()))?;

        Ok(GaugeFamily {
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            vec,
        })
    }

    /// Declare a counter family with the given label schema
    pub fn declare_counter(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<CounterFamily> {
        let vec = IntCounterVec::new(Opts::new(name, help), labels)
            .map_err(|e| MetricsError::Registry(format!("Invalid counter {}: {}", name, e)))?;
        self.register(name, Box::new(vec.clone()))?;

        Ok(CounterFamily {
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            vec,
        })
    }

    fn register(&self, name: &str, collector: Box<dyn Collector>) -> Result<()> {
        self.inner
            .registry
            .register(collector)
            .map_err(|e| MetricsError::Registry(format!("Failed to register {}: {}", name, e)))?;
        debug!("Declared metric family {}", name);
        Ok(())
    }

    /// Render every written label combination as Prometheus text.
    ///
    /// Families that were declared but never written are omitted.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to convert metrics to string: {}", e)))
    }
}

/// Builder for creating a MetricsRegistry
#[derive(Debug, Default)]
pub struct MetricsRegistryBuilder {
    global_labels: HashMap<String, String>,
}

impl MetricsRegistryBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach constant labels to every family
    pub fn with_global_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.global_labels.extend(labels);
        self
    }

    /// Build the MetricsRegistry
    pub fn build(self) -> Result<MetricsRegistry> {
        MetricsRegistry::with_global_labels(self.global_labels)
    }
}

/// Labeled last-value gauges
#[derive(Debug, Clone)]
pub struct GaugeFamily {
    name: String,
    labels: Vec<String>,
    vec: GaugeVec,
}

impl GaugeFamily {
    /// Overwrite the value for one label combination
    pub fn set(&self, label_values: &[&str], value: f64) -> Result<()> {
        self.vec
            .get_metric_with_label_values(label_values)
            .map_err(|e| MetricsError::Registry(format!("{}: {}", self.name, e)))?
            .set(value);
        Ok(())
    }

    /// Current value for a label combination, `None` if never written
    pub fn get(&self, label_values: &[&str]) -> Option<f64> {
        find_metric(&self.vec.collect(), &self.labels, label_values)
            .map(|m| m.get_gauge().get_value())
    }
}

/// Labeled monotonic counters
#[derive(Debug, Clone)]
pub struct CounterFamily {
    name: String,
    labels: Vec<String>,
    vec: IntCounterVec,
}

impl CounterFamily {
    /// Increment the counter for one label combination
    pub fn inc(&self, label_values: &[&str]) -> Result<()> {
        self.vec
            .get_metric_with_label_values(label_values)
            .map_err(|e| MetricsError::Registry(format!("{}: {}", self.name, e)))?
            .inc();
        Ok(())
    }

    /// Current count for a label combination, `None` if never incremented
    pub fn get(&self, label_values: &[&str]) -> Option<u64> {
        find_metric(&self.vec.collect(), &self.labels, label_values)
            .map(|m| m.get_counter().get_value() as u64)
    }
}

fn find_metric(
    families: &[prometheus::proto::MetricFamily],
    label_names: &[String],
    label_values: &[&str],
) -> Option<Metric> {
    if label_names.len() != label_values.len() {
        return None;
    }

    let wanted: HashMap<&str, &str> = label_names
        .iter()
        .map(String::as_str)
        .zip(label_values.iter().copied())
        .collect();

    families
        .iter()
        .flat_map(|family| family.get_metric().iter())
        .find(|metric| {
            let matched = metric
                .get_label()
                .iter()
                .filter(|pair| wanted.get(pair.get_name()) == Some(&pair.get_value()))
                .count();
            matched == wanted.len()
        })
        .cloned()
}
