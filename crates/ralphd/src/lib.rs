//! ralphd - loop monitor daemon
//!
//! Observes agent loops through the artifacts they leave on disk (locally or
//! inside a container), reconciles them into loop records, pushes typed change
//! events to observers and multiplexes read-only terminal attachments.

pub mod actions;
pub mod bus;
pub mod handlers;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod terminal;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use eyre::WrapErr;
use ralph_core::Config;
use server::AppContext;
use store::{ArtifactStore, LocalStore, RemoteStore};
use terminal::{PtyDimensions, TerminalMultiplexer, TmuxAttachSpawner};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use watch::poll::PollDriver;
use watch::IncrementalReconciler;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP server port (default: 7710). `0` picks a free port.
    pub port: u16,
    /// Workspace root; relative config paths resolve against it.
    pub workspace: PathBuf,
    pub config: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workspace: PathBuf::from("."),
            config: Config::default(),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    port: u16,
    ctx: Arc<AppContext>,
    /// Change driver started by `run`; taken and awaited by `shutdown`.
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Build the application context. The store backend follows `container`.
    pub fn new(config: DaemonConfig) -> eyre::Result<Self> {
        let DaemonConfig {
            port,
            workspace,
            mut config,
        } = config;
        config.resolve_paths(&workspace);
        if config.event_capacity == 0 {
            eyre::bail!("event_capacity must be at least 1");
        }
        if config.poll_interval_ms == 0 {
            eyre::bail!("poll_interval_ms must be at least 1");
        }

        let store: Arc<dyn ArtifactStore> = match &config.container {
            Some(container) => Arc::new(RemoteStore::new(
                &config.docker_bin,
                container,
                &config.remote_artifact_dir,
                config.remote_timeout(),
            )),
            None => Arc::new(LocalStore::new(&config.artifact_dir)),
        };

        let terminals = TerminalMultiplexer::new(
            Arc::new(TmuxAttachSpawner::from_config(&config)),
            PtyDimensions {
                rows: config.pty_rows,
                cols: config.pty_cols,
            },
        );

        Ok(Self {
            port,
            ctx: Arc::new(AppContext::new(config, store, terminals)),
            driver: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Run the change driver and the HTTP server until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        let config = &self.ctx.config;
        info!("ralphd starting on port {}", self.port);
        info!("artifact root: {}", config.artifact_root().display());
        match &config.container {
            Some(container) => info!("remote mode: container {}", container),
            None => info!("local mode"),
        }

        let loops = self.ctx.reconciler.list_loops().await;
        info!("found {} loop(s)", loops.len());

        let tracker = IncrementalReconciler::new(self.ctx.reconciler.clone(), self.ctx.bus.clone());
        let cancel = self.ctx.shutdown.child_token();
        let driver = if config.is_remote() {
            let poller = PollDriver::new(tracker).poll_when_idle(config.poll_when_idle);
            tokio::spawn(poller.run(config.poll_interval(), cancel))
        } else {
            let settle = config.settle_window();
            tokio::spawn(async move {
                if let Err(e) = watch::fs::run(tracker, settle, cancel).await {
                    error!("file watcher error: {}", e);
                }
            })
        };

        *self.driver.lock().await = Some(driver);

        let served = server::start_server(Arc::clone(&self.ctx), self.port).await;

        // Whatever ended the server also ends the driver.
        self.shutdown().await;
        served.wrap_err("HTTP server error")
    }

    /// Stop the server, kill all terminals and wait for the change driver to
    /// release its watch. Idempotent.
    pub async fn shutdown(&self) {
        if !self.ctx.shutdown.is_cancelled() {
            info!("shutting down");
        }
        self.ctx.shutdown.cancel();
        self.ctx.terminals.shutdown().await;

        // Held across the join so a concurrent caller also waits for it.
        let mut driver = self.driver.lock().await;
        if let Some(handle) = driver.take() {
            if let Err(e) = handle.await {
                error!("change driver task failed: {}", e);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_daemon_resolves_artifact_dir() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(DaemonConfig {
            workspace: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        })
        .unwrap();
        assert_eq!(
            daemon.context().store.layout().root(),
            dir.path().join(".claude")
        );
    }

    #[test]
    fn remote_daemon_uses_container_root() {
        let mut config = Config::default();
        config.container = Some("sandbox".to_string());
        let daemon = Daemon::new(DaemonConfig {
            config,
            ..DaemonConfig::default()
        })
        .unwrap();
        assert_eq!(
            daemon.context().store.layout().root(),
            std::path::Path::new("/workspace/.claude")
        );
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let mut config = Config::default();
        config.event_capacity = 0;
        assert!(Daemon::new(DaemonConfig {
            config,
            ..DaemonConfig::default()
        })
        .is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = Config::default();
        config.container = Some("sandbox".to_string());
        config.poll_interval_ms = 0;
        assert!(Daemon::new(DaemonConfig {
            config,
            ..DaemonConfig::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_driver_after_run_is_dropped() {
        let dir = TempDir::new().unwrap();
        let daemon = Arc::new(
            Daemon::new(DaemonConfig {
                port: 0,
                workspace: dir.path().to_path_buf(),
                ..DaemonConfig::default()
            })
            .unwrap(),
        );

        // A signal ends `run` by dropping it mid-serve.
        let runner = Arc::clone(&daemon);
        let run = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert!(daemon.driver.lock().await.is_some());

        daemon.shutdown().await;
        assert!(daemon.driver.lock().await.is_none());
        assert!(daemon.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(DaemonConfig {
            workspace: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        })
        .unwrap();
        daemon.shutdown().await;
        daemon.shutdown().await;
        assert!(daemon.is_shutdown());
        assert!(daemon.context().terminals.is_shut_down());
    }
}
