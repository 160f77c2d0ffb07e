//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{Error, Result};

use super::handlers;
use super::ApiState;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    let _ = encode(&mut buffer, &crate::controller::metrics::REGISTRY);
    buffer
}

pub fn router(state: Arc<ApiState>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/v1/configuration/datasets",
            get(handlers::list_configured_datasets).post(handlers::create_dataset),
        )
        .route(
            "/v1/configuration/datasets/{dataset_id}",
            post(handlers::update_dataset).delete(handlers::delete_dataset),
        )
        .route("/v1/state/datasets", get(handlers::list_dataset_state));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until the process exits
pub async fn run_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Config(format!("Server error: {}", e)))?;

    Ok(())
}
