//! Claim API Server
//!
//! Runs the REST server the cluster's transport layer calls into for
//! prepare/unprepare, with broadcast-driven graceful shutdown.

use crate::driver::Driver;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the claim API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Serve unprepare synchronously instead of deferring to reconciliation
    pub synchronous_unprepare: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: "0.0.0.0:8090".parse().unwrap(),
            synchronous_unprepare: false,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Claim API server
pub struct ApiServer {
    config: ApiServerConfig,
    driver: Arc<Driver>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, driver: Arc<Driver>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            driver,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown is triggered
    pub async fn run(&self) -> Result<()> {
        info!("Starting claim API server");
        info!("  REST API: {}", self.config.rest_addr);
        info!(
            "  Unprepare mode: {}",
            if self.config.synchronous_unprepare {
                "synchronous"
            } else {
                "deferred"
            }
        );

        let rest_handle = self.spawn_rest_server();

        tokio::select! {
            result = rest_handle => {
                if let Err(e) = result {
                    error!("REST server error: {:?}", e);
                }
            }
        }

        Ok(())
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let driver = self.driver.clone();
        let synchronous_unprepare = self.config.synchronous_unprepare;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            run_rest_server(addr, driver, synchronous_unprepare, shutdown_rx).await
        })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    driver: Arc<Driver>,
    synchronous_unprepare: bool,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let router = RestRouter::new(driver, synchronous_unprepare);
    let app = router.build();

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
