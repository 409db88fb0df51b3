//! HTTP endpoint for serving metrics

use crate::{MetricsRegistry, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Pull endpoint rendering the registry on every scrape
#[derive(Debug, Clone)]
pub struct MetricsEndpoint {
    registry: MetricsRegistry,
    bind_addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    pub fn new(registry: MetricsRegistry, bind_addr: SocketAddr) -> Self {
        Self {
            registry,
            bind_addr,
        }
    }

    /// Get the metrics URL for the configured address
    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.bind_addr)
    }

    /// Bind the listening socket
    pub async fn bind(self) -> Result<BoundEndpoint> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Metrics endpoint listening on {}", local_addr);

        Ok(BoundEndpoint {
            registry: self.registry,
            listener,
            local_addr,
        })
    }
}

/// A metrics endpoint with its socket bound
#[derive(Debug)]
pub struct BoundEndpoint {
    registry: MetricsRegistry,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundEndpoint {
    /// Address actually bound, useful when the port was 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the metrics URL
    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.local_addr)
    }

    /// Serve scrapes until `shutdown` completes
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.registry);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Metrics endpoint on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Create the Axum application. Only `GET /metrics` is routed.
pub fn router(registry: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<MetricsRegistry>) -> Response {
    match registry.render() {
        Ok(metrics) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            metrics,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics").into_response()
        }
    }
}
