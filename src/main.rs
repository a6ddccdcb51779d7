//! TrueNAS Volume Driver
//!
//! Runs the volume driver as a standalone service exposing the REST API.
//! With `--simulate` the driver talks to an in-process appliance instead
//! of a real TrueNAS system.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use truenas_volume_driver::{
    ApiServer, ApiServerConfig, DriverConfig, InMemoryAppliance, SimulatorConfig, VolumeManager,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TrueNAS Volume Driver - block volumes on ZFS appliances over iSCSI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "DRIVER_CONFIG")]
    config: Option<String>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8776")]
    api_addr: String,

    /// Appliance base URL (overrides the configuration file)
    #[arg(long, env = "TRUENAS_URL")]
    appliance_url: Option<String>,

    /// Appliance API key (overrides the configuration file)
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Parent dataset for volumes, e.g. tank/cinder
    #[arg(long, env = "TRUENAS_DATASET_PATH")]
    dataset_parent: Option<String>,

    /// Allow cross-origin REST requests
    #[arg(long, env = "API_PERMISSIVE_CORS")]
    permissive_cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Serve against an in-memory appliance
    #[arg(long, env = "SIMULATE")]
    simulate: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting TrueNAS Volume Driver");
    info!("  Version: {}", truenas_volume_driver::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Dataset parent: {}", config.dataset_parent);
    info!("  Default provisioning: {}", config.default_provisioning);
    info!("  Simulated appliance: {}", args.simulate);

    let manager = if args.simulate {
        let simulator = SimulatorConfig {
            parent: config.dataset_parent.clone(),
            api_key: config.appliance.api_key.clone().unwrap_or_default(),
            ..Default::default()
        };
        VolumeManager::new(config, Arc::new(InMemoryAppliance::new(simulator)))?
    } else {
        VolumeManager::connect(config)?
    };

    manager
        .check_setup()
        .await
        .context("appliance setup check failed")?;

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .with_context(|| format!("invalid REST API address {}", args.api_addr))?,
        permissive_cors: args.permissive_cors,
    };
    let server = ApiServer::new(api_config, manager);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
        let _ = shutdown.send(());
    });

    server.run().await?;

    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => DriverConfig::default(),
    };

    if let Some(url) = &args.appliance_url {
        config.appliance.url = url.clone();
    }
    if let Some(key) = &args.api_key {
        config.appliance.api_key = Some(key.clone());
    }
    if let Some(parent) = &args.dataset_parent {
        config.dataset_parent = parent.clone();
    }

    if args.simulate {
        if config.appliance.url.is_empty() {
            config.appliance.url = "https://truenas.simulated".to_string();
        }
        if config.appliance.credentials().is_err() {
            config.appliance.api_key = Some(SimulatorConfig::default().api_key);
        }
        if config.dataset_parent.is_empty() {
            config.dataset_parent = SimulatorConfig::default().parent;
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower_http=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
