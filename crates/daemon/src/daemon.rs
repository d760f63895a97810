//! Daemon startup and lifecycle
//!
//! Wires configuration into the governor, sweeper and HTTP server, and owns
//! the shutdown order: stop admitting and kill running transcodes first, then
//! let the server drain, then stop the sweeper.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::governor::Governor;
use crate::server::{create_router, serve, AppState, ServerError, ServerSettings};
use crate::startup::{run_startup_checks, StartupError};
use crate::sweeper::RetentionSweeper;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    pub governor: Arc<Governor>,
}

impl Daemon {
    /// Load configuration (missing file means defaults), run startup checks
    /// and build the governor.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::assemble(config))
    }

    /// Initialize the daemon without running startup checks
    ///
    /// The work directory is still created.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        warn!("skipping startup checks");
        std::fs::create_dir_all(&config.storage.work_dir)?;
        Ok(Self::assemble(config))
    }

    fn assemble(config: Config) -> Self {
        let concurrency_plan = derive_plan(&config);
        let governor = Arc::new(Governor::from_config(&config, &concurrency_plan));
        info!(
            total_cores = concurrency_plan.total_cores,
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            work_dir = %config.storage.work_dir.display(),
            "daemon initialized"
        );
        Self {
            config,
            concurrency_plan,
            governor,
        }
    }

    fn sweeper(&self) -> RetentionSweeper {
        let retention = &self.config.retention;
        RetentionSweeper::new(
            self.config.storage.work_dir.clone(),
            Duration::from_secs(retention.retention_secs),
            Duration::from_secs(retention.sweep_interval_secs),
            Duration::from_secs(retention.initial_delay_secs),
            self.governor.table(),
        )
    }

    /// Serve until SIGINT or SIGTERM, then shut everything down.
    pub async fn run(self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `stop` resolves.
    pub async fn run_until<F>(self, stop: F) -> Result<(), DaemonError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let sweeper_task = tokio::spawn(self.sweeper().run(cancel.clone()));

        // Resolve the capability probe before the first upload needs it.
        let warm = Arc::clone(&self.governor);
        tokio::spawn(async move {
            warm.capability().has_time_stretch_filter().await;
        });

        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "listening");

        let router = create_router(AppState::new(
            Arc::clone(&self.governor),
            ServerSettings::from_config(&self.config),
        ));

        let governor = Arc::clone(&self.governor);
        let on_stop = async move {
            stop.await;
            info!("shutdown requested");
            governor.shutdown().await;
        };

        let served = serve(listener, router, on_stop).await;

        cancel.cancel();
        let _ = sweeper_task.await;
        info!("daemon stopped");
        served.map_err(DaemonError::from)
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
