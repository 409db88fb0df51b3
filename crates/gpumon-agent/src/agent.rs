//! Core agent implementation

use crate::isolation::panic_message;
use crate::poller::{DevicePoller, POLL_INTERVAL};
use crate::{config::AgentConfig, AgentError, Result};
use futures::FutureExt;
use gpumon_adapter_gpu::{create_library, GpuLibrary};
use gpumon_metrics::{GpuMetrics, MetricsEndpoint, MetricsRegistry, MetricsRegistryBuilder};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

type PollerExit = (u32, std::thread::Result<Result<()>>);

/// The gpumon agent: one poller per device plus the metrics endpoint
pub struct Agent {
    config: AgentConfig,
    library: Arc<dyn GpuLibrary>,
    registry: MetricsRegistry,
    metrics: GpuMetrics,
    poll_interval: Duration,
}

impl Agent {
    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Get the metrics registry
    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Name of the GPU library backend in use
    pub fn backend_name(&self) -> &'static str {
        self.library.name()
    }

    /// Run the agent until Ctrl+C or SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the agent until `shutdown` completes or a required failure occurs.
    ///
    /// The library is shut down exactly once if it was initialized, whatever
    /// the outcome. An error from the run takes precedence over a shutdown
    /// error.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting gpumon agent with {} backend", self.library.name());

        self.library.initialize().await?;

        let result = self.serve(shutdown).await;
        let shutdown_result = self.library.shutdown().await;

        match (result, shutdown_result) {
            (Ok(()), Ok(())) => {
                info!("gpumon agent stopped");
                Ok(())
            }
            (Ok(()), Err(e)) => {
                error!("GPU library shutdown failed: {}", e);
                Err(e.into())
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_error)) => {
                warn!("GPU library shutdown also failed: {}", shutdown_error);
                Err(e)
            }
        }
    }

    async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let device_count = self.library.device_count().await?;
        info!("Found {} GPU device(s)", device_count);

        let endpoint = MetricsEndpoint::new(self.registry.clone(), self.config.exporter.bind_addr)
            .bind()
            .await?;
        info!("Serving metrics at {}", endpoint.metrics_url());

        let mut pollers = JoinSet::new();
        for index in 0..device_count {
            let poller = DevicePoller::new(index, self.library.clone(), self.metrics.clone())
                .with_interval(self.poll_interval);
            pollers.spawn(async move {
                let exit = AssertUnwindSafe(poller.run()).catch_unwind().await;
                (index, exit)
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(endpoint.serve(async move {
            let _ = stop_rx.await;
        }));
        let mut server_done = false;

        let mut result = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            joined = &mut server => {
                server_done = true;
                Err(server_failure(joined))
            }
            Some(joined) = pollers.join_next() => Err(poller_failure(joined)),
        };

        pollers.abort_all();
        while pollers.join_next().await.is_some() {}

        if !server_done {
            let _ = stop_tx.send(());
            let joined = server.await;
            if result.is_ok() && !matches!(joined, Ok(Ok(()))) {
                result = Err(server_failure(joined));
            }
        }

        result
    }
}

fn server_failure(
    joined: std::result::Result<gpumon_metrics::Result<()>, JoinError>,
) -> AgentError {
    let error = match joined {
        Ok(Ok(())) => AgentError::Service("metrics endpoint stopped unexpectedly".to_string()),
        Ok(Err(e)) => AgentError::Metrics(e),
        Err(e) => AgentError::Service(format!("metrics endpoint task failed: {}", e)),
    };
    error!("{}", error);
    error
}

fn poller_failure(joined: std::result::Result<PollerExit, JoinError>) -> AgentError {
    let error = match joined {
        Ok((_, Ok(Err(e)))) => e,
        Ok((index, Ok(Ok(())))) => AgentError::PollerExited { index },
        Ok((index, Err(panic))) => AgentError::PollerPanicked {
            index,
            message: panic_message(&panic),
        },
        Err(e) => AgentError::Service(format!("poller task failed: {}", e)),
    };
    error!("Stopping agent: {}", error);
    error
}

/// Resolve when the process receives Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Builder for creating agents
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    library: Option<Arc<dyn GpuLibrary>>,
    registry: Option<MetricsRegistry>,
    poll_interval: Duration,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self {
            config: None,
            library: None,
            registry: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an already constructed GPU library instead of the configured backend
    pub fn with_library(mut self, library: Arc<dyn GpuLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    /// Write into an existing registry.
    ///
    /// The configured global labels only apply to registries the builder
    /// creates itself.
    pub fn with_registry(mut self, registry: MetricsRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the agent
    pub fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let library = match self.library {
            Some(library) => library,
            None => create_library(&config.gpu)?,
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => MetricsRegistryBuilder::new()
                .with_global_labels(config.exporter.global_labels.clone())
                .build()?,
        };

        let metrics = GpuMetrics::declare(&registry, config.exporter.label_scheme)?;

        Ok(Agent {
            config,
            library,
            registry,
            metrics,
            poll_interval: self.poll_interval,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpumon_adapter_gpu::mock::MockGpuLibrary;
    use gpumon_adapter_gpu::{GpuBackend, GpuLibraryConfig};

    fn mock_config(devices: u32) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.exporter.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.gpu = GpuLibraryConfig::new(GpuBackend::Mock).with_mock_device_count(devices);
        config
    }

    #[test]
    fn test_agent_builder_uses_configured_backend() {
        let agent = AgentBuilder::new().with_config(mock_config(2)).build().unwrap();
        assert_eq!(agent.backend_name(), "mock");
        assert_eq!(agent.config().gpu.mock_device_count, 2);
    }

    #[test]
    fn test_agent_builder_rejects_invalid_config() {
        let mut config = mock_config(1);
        config.logging.level = "loud".to_string();

        let result = AgentBuilder::new().with_config(config).build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_until_immediate_shutdown() {
        let library = Arc::new(MockGpuLibrary::new(1));
        let agent = AgentBuilder::new()
            .with_config(mock_config(1))
            .with_library(library.clone())
            .build()
            .unwrap();

        agent.run_until(async {}).await.unwrap();

        assert!(library.is_initialized());
        assert!(library.is_shut_down());
    }

    #[tokio::test]
    async fn test_zero_devices_waits_for_shutdown() {
        let library = Arc::new(MockGpuLibrary::new(0));
        let agent = AgentBuilder::new()
            .with_config(mock_config(1))
            .with_library(library.clone())
            .build()
            .unwrap();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        agent.run_until(shutdown).await.unwrap();

        assert!(library.is_shut_down());
        let text = agent.metrics_registry().render().unwrap();
        assert!(!text.contains("device_id"));
    }

    #[tokio::test]
    async fn test_required_failure_stops_agent() {
        let library = Arc::new(MockGpuLibrary::new(1));
        let agent = AgentBuilder::new()
            .with_config(mock_config(1))
            .with_library(library.clone())
            .with_poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();

        library.fail_utilization(0, true);
        let err = agent.run_until(std::future::pending()).await.unwrap_err();

        assert!(err.to_string().contains("utilization_rates failed for GPU 0"));
        assert!(library.is_shut_down());
    }

    #[test]
    fn test_poller_failure_maps_panic_payload() {
        let panic: Box<dyn std::any::Any + Send> = Box::new("device vanished");
        let error = poller_failure(Ok((3, Err(panic))));
        assert!(matches!(
            error,
            AgentError::PollerPanicked { index: 3, ref message } if message == "device vanished"
        ));

        let error = poller_failure(Ok((2, Ok(Ok(())))));
        assert!(matches!(error, AgentError::PollerExited { index: 2 }));
    }

    fn agent_with(library: &Arc<MockGpuLibrary>, config: AgentConfig) -> Agent {
        AgentBuilder::new()
            .with_config(config)
            .with_library(library.clone())
            .with_poll_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_initialization_failure_is_fatal() {
        let library = Arc::new(MockGpuLibrary::new(1));
        library.fail_initialize(true);
        let agent = agent_with(&library, mock_config(1));

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Gpu(gpumon_adapter_gpu::GpuError::InitializationFailed(_))
        ));
        assert!(!library.is_shut_down());
    }

    #[tokio::test]
    async fn test_device_count_failure_shuts_library_down() {
        let library = Arc::new(MockGpuLibrary::new(1));
        library.fail_device_count(true);
        let agent = agent_with(&library, mock_config(1));

        assert!(agent.run_until(std::future::pending()).await.is_err());
        assert!(library.is_shut_down());
    }

    #[tokio::test]
    async fn test_required_failure_on_second_device() {
        let library = Arc::new(MockGpuLibrary::new(2));
        library.fail_utilization(1, true);
        let agent = agent_with(&library, mock_config(2));

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("utilization_rates failed for GPU 1"));
        assert!(library.is_shut_down());
    }

    #[tokio::test]
    async fn test_resolution_failure_is_fatal() {
        let library = Arc::new(MockGpuLibrary::new(2));
        library.fail_resolution(0, true);
        let agent = agent_with(&library, mock_config(2));

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Gpu(gpumon_adapter_gpu::GpuError::Resolution { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_pcie_failures_keep_agent_running() {
        let library = Arc::new(MockGpuLibrary::new(2));
        library.fail_pcie(0, Some(gpumon_adapter_gpu::PcieCounter::Count));
        let agent = agent_with(&library, mock_config(2));

        agent.run_until(sleep_ms(200)).await.unwrap();

        assert!(library.utilization_queries(0) > 1);
        let text = agent.metrics_registry().render().unwrap();
        assert!(text.contains(
            "optional_metric_failures_total{device_id=\"0\",group=\"pcie_throughput\"}"
        ));
        assert!(text.contains("pcie_throughput{device_id=\"0\",type=\"tx\"} 1000"));
        assert!(text.contains("pcie_throughput{device_id=\"1\",type=\"count\"} 2"));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_exports_every_device() {
        let library = Arc::new(MockGpuLibrary::new(2));
        library.set_utilization(0, 42, 10);
        let agent = agent_with(&library, mock_config(2));

        agent.run_until(sleep_ms(100)).await.unwrap();

        let text = agent.metrics_registry().render().unwrap();
        assert!(text.contains("utilization_rates{device_id=\"0\",type=\"gpu\"} 42"));
        assert!(text.contains("utilization_rates{device_id=\"0\",type=\"memory\"} 10"));
        assert!(text.contains("memory_info{device_id=\"1\",type=\"total\"}"));
        assert!(library.is_shut_down());
    }

    #[tokio::test]
    async fn test_global_scheme_drops_device_label() {
        let library = Arc::new(MockGpuLibrary::new(2));
        library.set_utilization(0, 30, 3);
        library.set_utilization(1, 30, 3);
        let mut config = mock_config(2);
        config.exporter.label_scheme = gpumon_metrics::LabelScheme::Global;
        let agent = agent_with(&library, config);

        agent.run_until(sleep_ms(100)).await.unwrap();

        let text = agent.metrics_registry().render().unwrap();
        assert!(!text.contains("device_id"));
        assert!(text.contains("utilization_rates{type=\"gpu\"} 30"));
    }

    #[tokio::test]
    async fn test_occupied_port_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let library = Arc::new(MockGpuLibrary::new(1));
        let mut config = mock_config(1);
        config.exporter.bind_addr = taken.local_addr().unwrap();
        let agent = agent_with(&library, config);

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, AgentError::Metrics(_)));
        assert!(library.is_shut_down());
        assert_eq!(library.utilization_queries(0), 0);
    }

    #[tokio::test]
    async fn test_shutdown_failure_is_reported() {
        let library = Arc::new(MockGpuLibrary::new(1));
        library.fail_shutdown(true);
        let agent = agent_with(&library, mock_config(1));

        let err = agent.run_until(sleep_ms(30)).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Gpu(gpumon_adapter_gpu::GpuError::ShutdownFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_run_error_wins_over_shutdown_error() {
        let library = Arc::new(MockGpuLibrary::new(1));
        library.fail_shutdown(true);
        library.fail_memory(0, true);
        let agent = agent_with(&library, mock_config(1));

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("memory_info failed for GPU 0"));
    }

    #[tokio::test]
    async fn test_agent_can_run_twice() {
        let library = Arc::new(MockGpuLibrary::new(1));
        let agent = agent_with(&library, mock_config(1));

        agent.run_until(sleep_ms(30)).await.unwrap();
        library.set_utilization(0, 55, 5);
        agent.run_until(sleep_ms(30)).await.unwrap();

        let text = agent.metrics_registry().render().unwrap();
        assert!(text.contains("utilization_rates{device_id=\"0\",type=\"gpu\"} 55"));
    }

    #[test]
    fn test_registry_with_gpu_families_rejected_at_build() {
        let registry = MetricsRegistry::new().unwrap();
        GpuMetrics::declare(&registry, gpumon_metrics::LabelScheme::PerDevice).unwrap();

        let result = AgentBuilder::new()
            .with_config(mock_config(1))
            .with_registry(registry)
            .build();
        assert!(matches!(result, Err(AgentError::Metrics(_))));
    }

    #[tokio::test]
    async fn test_global_labels_on_every_series() {
        let library = Arc::new(MockGpuLibrary::new(1));
        library.set_utilization(0, 42, 10);
        let mut config = mock_config(1);
        config
            .exporter
            .global_labels
            .insert("host".to_string(), "node-1".to_string());
        let agent = agent_with(&library, config);

        agent.run_until(sleep_ms(50)).await.unwrap();

        let text = agent.metrics_registry().render().unwrap();
        assert!(text.contains(
            "utilization_rates{device_id=\"0\",host=\"node-1\",type=\"gpu\"} 42"
        ));
    }
}
