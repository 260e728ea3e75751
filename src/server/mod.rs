//! HTTP control API over the job engine, evolution pipeline and session store.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::evolution::EvolutionPipeline;
use crate::orchestrator::JobEngine;
use crate::session::SessionStore;

pub use api::{ApiError, AppState, SharedState};

/// Configuration for the control server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from any host.
    pub permissive_cors: bool,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            permissive_cors: false,
        }
    }
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: JobEngine::from_config(config.clone()),
            pipeline: EvolutionPipeline::new(config),
            sessions: SessionStore::new(config.sessions_dir(), &config.session),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the control server and run until Ctrl+C.
pub async fn start_server(config: &Config, server: ServerConfig) -> Result<()> {
    config.ensure_directories()?;
    let state = Arc::new(AppState::from_config(config));

    let mut app = build_router(state);
    if server.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, projects_root = %config.server.projects_root.display(), "Control server listening");
    println!("evolve control API running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvolveToml;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempdir().unwrap();
        let config = Config::from_toml(dir.path().join(".evolve"), EvolveToml::default());
        let app = build_router(Arc::new(AppState::from_config(&config)));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let dir = tempdir().unwrap();
        let config = Config::from_toml(dir.path().join(".evolve"), EvolveToml::default());
        let app = build_router(Arc::new(AppState::from_config(&config)));
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
