//! sitewatch - Website Health Monitoring
//!
//! Periodically checks a list of URLs, records metrics for each check and
//! raises threshold alarms when sites stay unhealthy.

mod alarm;
mod config;
mod db;
mod metrics;
mod probe;
mod scheduler;
mod web;

use alarm::Notifier;
use config::ServerConfig;
use db::{NewTarget, Store};
use probe::Checker;
use scheduler::{RunSettings, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("sitewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting sitewatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Seed targets if none exist
    if store.list_targets(None)?.is_empty() {
        for url in &cfg.seed_targets {
            tracing::info!("Adding seed target: {}", url);
            store.add_target(&NewTarget::new(url.as_str()))?;
        }
    }

    let checker = Checker::new(cfg.check_timeout, &cfg.user_agent)?;
    let notifier = Arc::new(Notifier::new(cfg.notify_targets(), store.clone(), cfg.check_timeout)?);

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        checker,
        notifier.clone(),
        RunSettings::from(&cfg),
    ));
    scheduler.start();

    // Start web server
    let server = Server::new(cfg, store, notifier);
    let result = server.start().await;
    scheduler.stop();
    result
}
