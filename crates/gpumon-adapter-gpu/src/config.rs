//! GPU library configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// GPU management library backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    /// NVIDIA Management Library
    Nvml,
    /// Mock backend for testing
    Mock,
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuBackend::Nvml => write!(f, "nvml"),
            GpuBackend::Mock => write!(f, "mock"),
        }
    }
}

/// GPU library configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuLibraryConfig {
    /// GPU backend to use
    pub backend: GpuBackend,

    /// Number of simulated devices when `backend` is `mock`
    #[serde(default = "default_mock_device_count")]
    pub mock_device_count: u32,
}

fn default_mock_device_count() -> u32 {
    2
}

impl Default for GpuLibraryConfig {
    fn default() -> Self {
        Self::new(GpuBackend::Nvml)
    }
}

impl GpuLibraryConfig {
    /// Create a configuration for the given backend
    pub fn new(backend: GpuBackend) -> Self {
        Self {
            backend,
            mock_device_count: default_mock_device_count(),
        }
    }

    /// Set the number of simulated devices
    pub fn with_mock_device_count(mut self, count: u32) -> Self {
        self.mock_device_count = count;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == GpuBackend::Mock && self.mock_device_count == 0 {
            return Err("mock_device_count must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GpuLibraryConfig::default();
        assert_eq!(config.backend, GpuBackend::Nvml);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mock_validation() {
        let config = GpuLibraryConfig::new(GpuBackend::Mock).with_mock_device_count(0);
        assert!(config.validate().is_err());

        let config = config.with_mock_device_count(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_serialization() {
        let yaml = serde_yaml::to_string(&GpuBackend::Nvml).unwrap();
        assert_eq!(yaml.trim(), "nvml");

        let config: GpuLibraryConfig = serde_yaml::from_str("backend: mock").unwrap();
        assert_eq!(config.backend, GpuBackend::Mock);
        assert_eq!(config.mock_device_count, 2);
        assert_eq!(config.backend.to_string(), "mock");
    }
}
