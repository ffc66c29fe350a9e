//! Fyr - rollout, alert and namespace investigation service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fyr::cluster::{ClusterClient, KubeCluster};
use fyr::service::{self, Role};
use fyr::{store, Settings};

/// Fyr - decide when a rollout, alert or namespace needs investigating.
#[derive(Parser)]
#[command(name = "fyr")]
#[command(about = "Rollout and alert watcher with investigation queue")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file (overrides FYR_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every loop and the HTTP server in one process
    Serve,
    /// Run the deployment watch, reconciliation and namespace scan
    Watcher,
    /// Run the HTTP intake, alert batching and job worker
    Analyzer,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let role = match cli.command {
        Commands::Serve => Role::All,
        Commands::Watcher => Role::Watcher,
        Commands::Analyzer => Role::Analyzer,
    };

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;
    let settings = Arc::new(settings);

    let store = store::open(&settings).context("Failed to open store")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeCluster::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    );

    info!(
        ?role,
        cluster = %settings.cluster_name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting fyr"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    service::run(role, settings, store, cluster, cancel)
        .await
        .context("Service stopped with an error")?;
    info!("Fyr stopped");
    Ok(())
}
