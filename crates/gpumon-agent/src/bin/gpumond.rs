//! Main binary for the GPU telemetry daemon (gpumond)

use clap::{Parser, Subcommand};
use gpumon_agent::{init_agent, AgentConfig, Result};
use gpumon_metrics::LabelScheme;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gpumond")]
#[command(about = "GPU utilization, memory and PCI-E exporter for Prometheus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address for the /metrics endpoint
    #[arg(short, long, value_name = "ADDR")]
    listen_address: Option<SocketAddr>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Drop the device_id label so all devices share one series per type
    #[arg(long)]
    global_scheme: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exporter
    Run {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            run_agent(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            run_agent(config_path, &cli).await
        }
    }
}

async fn run_agent(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = match config_path {
        Some(ref path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    // Apply CLI overrides
    if let Some(addr) = cli.listen_address {
        config.exporter.bind_addr = addr;
    }

    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }

    if cli.global_scheme {
        config.exporter.label_scheme = LabelScheme::Global;
    }

    let agent = init_agent(&config)?;

    match config_path {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    if let Err(e) = agent.run().await {
        error!("Agent failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        println!("{}", config.to_yaml()?);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("GPU backend: {}", config.gpu.backend);
    println!("Metrics endpoint: http://{}/metrics", config.exporter.bind_addr);
    println!("Label scheme: {:?}", config.exporter.label_scheme);

    Ok(())
}
