//! ---
//! kpg_section: "05-daemon"
//! kpg_subsection: "binary"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Binary entrypoint for the control plane daemon."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kpg_api::{spawn_api_server, ApiServer, ApiState};
use kpg_common::config::{AppConfig, RuntimeMode};
use kpg_common::logging::init_tracing;
use kpg_core::ControlPlane;
use kpg_metrics::{new_registry, SharedRegistry};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("kpgd ", env!("CARGO_PKG_VERSION")),
    about = "Kafka playground control plane",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the container runtime mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Docker,
    Simulated,
}

impl From<CliMode> for RuntimeMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Docker => RuntimeMode::Docker,
            CliMode::Simulated => RuntimeMode::Simulated,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the HTTP API (default)")]
    Serve,
    #[command(about = "Remove every added broker and cluster and restore the baseline services")]
    Reset {
        #[arg(long, help = "Confirm the reset; it is refused without this flag")]
        yes: bool,
    },
    #[command(about = "Print the host port validation report")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/kpgd.toml"));
    candidates.push(PathBuf::from("/etc/kpg/kpgd.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(mode) = cli.mode {
        config.runtime.mode = mode.into();
    }
    init_tracing("kpgd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), mode = ?config.runtime.mode, "configuration loaded"),
        None => info!(mode = ?config.runtime.mode, "no configuration file found; using defaults"),
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset removes every added broker, cluster and volume; re-run with --yes to confirm");
            }
            let plane = ControlPlane::from_config(&config)?;
            for action in plane.reset().await? {
                println!("{action}");
            }
        }
        Commands::Validate => {
            let plane = ControlPlane::from_config(&config)?;
            let report = plane.validate_config().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render report")?
            );
            if !report.valid {
                bail!("{} port conflict(s) found", report.issues.len());
            }
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let metrics_registry: Option<SharedRegistry> = if config.metrics.enabled {
        Some(new_registry())
    } else {
        info!("metrics disabled by configuration");
        None
    };

    let mut builder = ControlPlane::builder(&config);
    if let Some(registry) = &metrics_registry {
        builder = builder.metrics_registry(registry.clone());
    }
    let plane = Arc::new(builder.build()?);
    if let Err(err) = plane.check_runtime().await {
        warn!(error = %err, "container runtime not reachable yet; requests will fail until it is");
    }

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(plane.clone(), metrics_registry.clone()));
        let server = spawn_api_server(state, config.api.listen)?;
        info!(address = %server.addr(), "api server started");
        api_server = Some(server);
    } else {
        info!("api server disabled by configuration");
    }

    info!("daemon running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
