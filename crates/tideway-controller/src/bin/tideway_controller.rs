//! Tideway workflow-run controller.
//!
//! ## Usage
//!
//! ```bash
//! # Run against in-memory collaborators until Ctrl-C
//! tideway-controller serve --max-concurrent-runs 4
//!
//! # Print the effective configuration
//! tideway-controller check-config
//! ```
//!
//! Every flag can also be set through its `TIDEWAY_*` environment variable.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tideway_core::observability::{LogFormat, init_logging};
use tideway_controller::config::{CONFIG_MAP_DATA_KEY, ControllerConfig};
use tideway_controller::model::ConfigMap;
use tideway_controller::runtime::{ClusterApis, InMemoryCluster, ProcessContext};
use tideway_controller::shipping::EventPublisher;
use tideway_controller::store::ResourceStore;

/// Tideway workflow-run controller.
#[derive(Debug, Parser)]
#[command(name = "tideway-controller")]
#[command(about = "Admits, times out and collects workflow runs")]
#[command(version)]
struct Args {
    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "TIDEWAY_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    /// Cap on concurrently running runs per namespace.
    #[arg(long, global = true)]
    max_concurrent_runs: Option<usize>,

    /// Default run deadline in seconds.
    #[arg(long, global = true)]
    run_timeout_secs: Option<u64>,

    /// Workers per controller.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Disable garbage collection.
    #[arg(long, global = true)]
    no_gc: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the controller until interrupted.
    Serve,

    /// Validate and print the effective configuration as JSON.
    CheckConfig,
}

impl Args {
    fn config(&self) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::from_env().context("loading TIDEWAY_* configuration")?;
        if let Some(limit) = self.max_concurrent_runs {
            config.max_concurrent_runs = limit;
        }
        if let Some(timeout) = self.run_timeout_secs {
            config.run_timeout_secs = timeout;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.no_gc {
            config.gc_enabled = false;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

async fn serve(config: ControllerConfig) -> Result<()> {
    let cluster = InMemoryCluster::default();
    let document = serde_json::to_string_pretty(&config)?;
    cluster
        .config_maps
        .create(
            ConfigMap::new(config.config_map_namespace.clone(), config.config_map_name.clone())
                .with_entry(CONFIG_MAP_DATA_KEY, document),
        )
        .await
        .context("seeding controller config map")?;

    tracing::info!(
        max_concurrent_runs = config.max_concurrent_runs,
        run_timeout_secs = config.run_timeout_secs,
        workers = config.workers,
        gc_enabled = config.gc_enabled,
        "Starting controller"
    );
    let context = ProcessContext::new(config, ClusterApis::in_memory(&cluster), EventPublisher::disabled())?;
    context.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    context.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogFormat::from_name(&args.log_format));
    let config = args.config()?;

    match args.command {
        Commands::Serve => serve(config).await,
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
