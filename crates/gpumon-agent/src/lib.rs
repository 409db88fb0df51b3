//! # gpumon-agent
//!
//! GPU telemetry agent (gpumond daemon).
//!
//! The agent initializes the GPU management library, starts one poller per
//! enumerated device and serves the current gauge values on `/metrics`
//! until the process is asked to stop. Failures of required metric groups
//! stop the whole agent; failures of optional groups are counted and
//! otherwise ignored.

pub mod agent;
pub mod config;
pub mod isolation;
pub mod poller;

// Re-export commonly used types
pub use agent::{shutdown_signal, Agent, AgentBuilder};
pub use config::{AgentConfig, ExporterConfig, LoggingConfig};
pub use isolation::{isolate, Isolated};
pub use poller::{DevicePoller, PollOutcome, POLL_INTERVAL};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GPU error: {0}")]
    Gpu(#[from] gpumon_adapter_gpu::GpuError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] gpumon_metrics::MetricsError),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Poller for GPU {index} panicked: {message}")]
    PollerPanicked { index: u32, message: String },

    #[error("Poller for GPU {index} exited unexpectedly")]
    PollerExited { index: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and build the agent from `config`
pub fn init_agent(config: &AgentConfig) -> Result<Agent> {
    init_logging(&config.logging)?;

    tracing::debug!("Initializing gpumon agent with config: {:?}", config);

    AgentBuilder::new().with_config(config.clone()).build()
}

/// Initialize logging and tracing
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let result = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    result.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}
