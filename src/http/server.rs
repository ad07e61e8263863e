//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers::{self, AppState};
use crate::error::Result;
use crate::ratelimit::{Clock, LimiterRegistry};

/// Build the admission API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/limits/{name}/check", post(handlers::check_limit))
        .route("/v1/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// HTTP server for the admission API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Handler state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server over a registry.
    pub fn new(addr: SocketAddr, registry: Arc<LimiterRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            addr,
            state: AppState::new(registry, clock),
        }
    }

    /// Get the configured bind address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server for admission API");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
