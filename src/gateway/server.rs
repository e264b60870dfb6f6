//! Gateway server and standalone log worker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::router::{AppState, create_router};
use crate::config::{Config, StoreBackend};
use crate::store::Stores;
use crate::telemetry::LogWorker;
use crate::{Error, Result};

/// Interval between expiry sweeps of the in-memory stores
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// API gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Store handles, closed after the server stops
    stores: Stores,
    /// Shutdown broadcast
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Create a gateway connected to the configured stores
    pub async fn new(config: Config) -> Result<Self> {
        let stores = Stores::connect(&config).await?;
        Ok(Self::with_stores(config, stores))
    }

    /// Create a gateway over existing store handles
    #[must_use]
    pub fn with_stores(config: Config, stores: Stores) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            stores,
            shutdown_tx,
        }
    }

    /// Sender that stops the gateway when a message is sent
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on `listener` until Ctrl+C, SIGTERM or the shutdown handle fires
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let state = Arc::new(AppState::new(&self.config, &self.stores)?);
        let app = create_router(state);

        let worker = self.spawn_worker();
        self.spawn_sweeper();

        let local_addr = listener.local_addr()?;
        info!("============================================================");
        info!("API GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local_addr, "Listening");
        info!(
            routes = self.config.routes.len(),
            clients = self.config.clients.len(),
            "Static configuration loaded"
        );
        info!(
            backend = ?self.config.store.backend,
            rate_limit = self.config.rate_limit.enabled,
            cache = self.config.cache.enabled,
            logging = self.config.log_pipeline.enabled,
            embedded_worker = worker.is_some(),
            "Pipeline stages"
        );
        if self.config.auth.admin_token.is_some() {
            info!("ADMIN API: /api/cache/clear, /api/cache/stats, /api/logs/queue");
        }
        info!("============================================================");

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(self.shutdown_tx.clone(), shutdown_rx))
        .await
        .map_err(|e| Error::Internal(e.to_string()));

        // Reaches the worker even when the server stopped on its own
        let _ = self.shutdown_tx.send(());

        if let Some(worker) = worker {
            wait_for_worker(worker, self.config.server.shutdown_timeout).await;
        }

        info!("Closing stores...");
        self.stores.close().await;
        served
    }

    fn spawn_worker(&self) -> Option<JoinHandle<()>> {
        let pipeline = &self.config.log_pipeline;
        if !pipeline.enabled || !pipeline.embedded_worker {
            return None;
        }
        let worker = Arc::new(LogWorker::new(
            Arc::clone(&self.stores.queue),
            Arc::clone(&self.stores.logs),
            pipeline,
        ));
        Some(worker.spawn(&self.shutdown_tx))
    }

    fn spawn_sweeper(&self) {
        if self.stores.is_shared() {
            return;
        }
        let stores = self.stores.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        stores.sweep_expired();
                        debug!("Swept expired in-memory entries");
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });
    }
}

/// Run the log worker without the HTTP server.
///
/// Requires the Redis backend: the in-memory queue is process-local and would
/// never receive jobs from a gateway process.
pub async fn run_worker(config: Config) -> Result<()> {
    if config.store.backend != StoreBackend::Redis {
        return Err(Error::Config(
            "The standalone worker requires store.backend = redis".to_string(),
        ));
    }

    let stores = Stores::connect(&config).await?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = Arc::new(LogWorker::new(
        Arc::clone(&stores.queue),
        Arc::clone(&stores.logs),
        &config.log_pipeline,
    ));
    info!(
        queue = %config.log_pipeline.queue,
        concurrency = config.log_pipeline.concurrency,
        "LOG WORKER v{} started",
        env!("CARGO_PKG_VERSION")
    );
    let handle = Arc::clone(&worker).spawn(&shutdown_tx);

    shutdown_signal(shutdown_tx, shutdown_rx).await;
    wait_for_worker(handle, config.server.shutdown_timeout).await;

    let stats = worker.stats();
    info!(
        completed = stats.completed,
        retried = stats.retried,
        failed = stats.failed,
        "Log worker stopped"
    );
    stores.close().await;
    Ok(())
}

async fn wait_for_worker(handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!("Log worker drained"),
        Ok(Err(e)) => warn!(error = %e, "Log worker task failed"),
        Err(_) => warn!(
            timeout_secs = timeout.as_secs(),
            "Log worker still busy at shutdown timeout, abandoning in-flight jobs"
        ),
    }
}

/// Shutdown signal handler
async fn shutdown_signal(
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Shutdown signal received"),
        () = terminate => info!("Shutdown signal received"),
        _ = shutdown_rx.recv() => info!("Shutdown requested"),
    }

    let _ = shutdown_tx.send(());
}
