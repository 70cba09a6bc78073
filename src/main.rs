//! pingwatch - HTTP(S) endpoint uptime monitor
//!
//! Periodically probes every registered URL, records up/down history and
//! serves it over a small JSON API.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use probe::HttpProber;
use scheduler::{CycleTimer, PingOrchestrator};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pingwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let prober = HttpProber::new(cfg.cycle.probe_timeout)?;
    tracing::info!(
        "Probe timeout {:?}, cycle budget {:?}, at most {} probes in flight",
        prober.timeout(),
        cfg.cycle.cycle_budget,
        cfg.cycle.max_concurrent_probes
    );

    let orchestrator = Arc::new(PingOrchestrator::new(store.clone(), Arc::new(prober), cfg.cycle));

    // Start the built-in trigger unless disabled
    let timer = match cfg.cycle_interval {
        Some(interval) => {
            let timer = CycleTimer::new(orchestrator.clone(), interval);
            timer.start().await;
            Some(timer)
        }
        None => {
            tracing::info!("Built-in cycle timer disabled; waiting for external triggers");
            None
        }
    };

    // Start web server
    let server = Server::new(cfg, store, orchestrator);
    server.start(shutdown_signal()).await?;

    if let Some(timer) = timer {
        timer.stop().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
