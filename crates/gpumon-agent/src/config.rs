//! Configuration management for the agent

use gpumon_adapter_gpu::GpuLibraryConfig;
use gpumon_metrics::LabelScheme;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Default address of the metrics endpoint
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9400";

/// Complete configuration for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Metrics endpoint configuration
    pub exporter: ExporterConfig,

    /// GPU library configuration
    pub gpu: GpuLibraryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Address the `/metrics` endpoint binds to
    pub bind_addr: SocketAddr,

    /// Whether series carry a `device_id` label
    pub label_scheme: LabelScheme,

    /// Constant labels attached to every exported series
    pub global_labels: HashMap<String, String>,
}

/// Label names owned by the GPU metric families
const RESERVED_LABELS: [&str; 3] = ["device_id", "type", "group"];

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 9400))),
            label_scheme: LabelScheme::PerDevice,
            global_labels: HashMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::AgentError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = self.to_yaml()?;

        std::fs::write(path, content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Serialize configuration as YAML
    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| crate::AgentError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.gpu
            .validate()
            .map_err(|e| crate::AgentError::Config(format!("GPU config validation failed: {}", e)))?;

        if let Some(name) = self
            .exporter
            .global_labels
            .keys()
            .find(|name| RESERVED_LABELS.contains(&name.as_str()))
        {
            return Err(crate::AgentError::Config(format!(
                "Global label {} clashes with a GPU metric label",
                name
            )));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}
