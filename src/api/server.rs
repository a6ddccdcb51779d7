//! API Server
//!
//! Serves the REST router until a shutdown signal is broadcast.

use super::rest::RestRouter;
use crate::driver::VolumeManager;
use crate::error::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Allow cross-origin requests from any origin
    pub permissive_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8776)),
            permissive_cors: false,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    manager: VolumeManager,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: VolumeManager) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            manager,
            shutdown_tx,
        }
    }

    /// Full router with tracing and CORS layers
    pub fn router(&self) -> axum::Router {
        let router = RestRouter::new(self.manager.clone())
            .build()
            .layer(TraceLayer::new_for_http());
        if self.config.permissive_cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", addr);

        self.serve(listener).await
    }

    /// Serve on an already bound listener. The shutdown subscription is
    /// taken before the returned future first runs.
    pub fn serve(
        &self,
        listener: tokio::net::TcpListener,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let router = self.router();

        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                    info!("REST server shutting down");
                })
                .await
                .map_err(|e| Error::Internal(format!("REST server error: {}", e)))
        }
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender that triggers shutdown, for signal handlers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::context;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8776);
        assert!(!config.permissive_cors);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let (ctx, _) = context();
        let server = ApiServer::new(ApiServerConfig::default(), VolumeManager::from_context(ctx));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(server.serve(listener));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
