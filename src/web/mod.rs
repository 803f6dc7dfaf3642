//! REST API server.

mod handlers;

use crate::alarm::Notifier;
use crate::config::ServerConfig;
use crate::db::Store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub notifier: Arc<Notifier>,
    /// Longest span a latency summary may cover
    pub sample_retention: Duration,
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(handlers::handle_health))
        // Targets
        .route(
            "/api/targets",
            get(handlers::handle_list_targets).post(handlers::handle_create_target),
        )
        .route(
            "/api/targets/{id}",
            get(handlers::handle_get_target)
                .put(handlers::handle_update_target)
                .delete(handlers::handle_delete_target),
        )
        .route("/api/targets/{id}/latency", get(handlers::handle_target_latency))
        // Alarms
        .route("/api/alarms", get(handlers::handle_list_alarms))
        .route("/api/alarms/history", get(handlers::handle_alarm_history))
        .route("/api/alarms/notifications", post(handlers::handle_alarm_notifications))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// API server for sitewatch.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, notifier: Arc<Notifier>) -> Self {
        let state = AppState {
            store,
            notifier,
            sample_retention: config.sample_retention,
        };
        Self { config, state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
