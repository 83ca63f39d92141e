//! HTTP server for orchestrad

use crate::config::ServerConfig;
use crate::kernel::Kernel;
use crate::routes;
use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub kernel: Kernel,
}

impl AppState {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }
}

/// Build the full router with tracing, timeout and body-size layers.
/// A request that outlives the timeout gets a SERVICE_UNAVAILABLE envelope.
pub fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::service_routes())
        .merge(routes::nav_routes())
        .merge(routes::config_routes())
        .merge(routes::backup_routes())
        .merge(routes::audit_routes())
        .merge(routes::metrics_routes())
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(HandleErrorLayer::new(routes::handle_layer_error))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    server.request_timeout_secs,
                )))
                .layer(RequestBodyLimitLayer::new(server.max_body_bytes)),
        )
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run<F>(state: AppState, server: &ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, server);

    let listener = tokio::net::TcpListener::bind(&server.bind)
        .await
        .with_context(|| format!("binding {}", server.bind))?;
    info!("[BOOT] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}
