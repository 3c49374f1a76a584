//! ralphd - loop monitor daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use ralph_core::config::DEFAULT_CONFIG_PATH;
use ralph_core::Config;
use ralphd::{Daemon, DaemonConfig, DEFAULT_PORT};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ralphd", about = "Ralph loop monitor daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Workspace root containing the artifact directory
    #[arg(short, long, env = "RALPH_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Extra config file, applied over the workspace config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Container to monitor instead of the local workspace
    #[arg(long, env = "RALPH_CONTAINER")]
    container: Option<String>,
}

/// Defaults, then `<workspace>/.ralph/config`, then `--config`, then flags.
fn load_config(cli: &Cli, workspace: &std::path::Path) -> eyre::Result<Config> {
    let mut config = Config::default();

    let workspace_config = workspace.join(DEFAULT_CONFIG_PATH);
    if workspace_config.exists() {
        config
            .load_file(&workspace_config)
            .wrap_err_with(|| format!("failed to load {}", workspace_config.display()))?;
    }
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?;
    }
    if let Some(container) = &cli.container {
        config.container = Some(container.clone());
    }
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let config = match load_config(&cli, &workspace) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let daemon = match Daemon::new(DaemonConfig {
        port: cli.port,
        workspace,
        config,
    }) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize daemon: {:#}", e);
            std::process::exit(1);
        }
    };

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {:#}", e);
                    }
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
            }
        }
    });
}
