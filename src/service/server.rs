use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use super::admin::{ADMIN_PREFIX, admin_router};
use super::host::{HOST_PREFIX, HostState, host_router};
use super::workspace::{WORKSPACE_PREFIX, workspace_router};
use crate::queue::BuildQueue;

/// Network settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8480,
            cors: false,
        }
    }
}

/// What this process serves: hosted builders, a build queue, or both.
#[derive(Default)]
pub struct Services {
    pub host: Option<HostState>,
    pub queue: Option<Arc<BuildQueue>>,
}

/// Build the full application router.
pub fn build_router(services: Services) -> Router {
    let mut app = Router::new().route("/health", get(|| async { "ok" }));
    if let Some(host) = services.host {
        app = app.nest(HOST_PREFIX, host_router(host));
    }
    if let Some(queue) = services.queue {
        app = app
            .nest(WORKSPACE_PREFIX, workspace_router(Arc::clone(&queue)))
            .nest(ADMIN_PREFIX, admin_router(queue));
    }
    app
}

/// Binds the listener. Port 0 picks a free port.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.bind, config.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

/// Serves until ctrl-c.
pub async fn start_server(config: ServerConfig, services: Services) -> Result<()> {
    let listener = bind(&config).await?;
    serve(listener, config.cors, services, shutdown_signal()).await
}

pub async fn serve(
    listener: TcpListener,
    cors: bool,
    services: Services,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let mut app = build_router(services);
    if cors {
        app = app.layer(CorsLayer::permissive());
    }

    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "buildq server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
