mod auth;
mod dispatcher;
mod gateway;
mod server;
mod settings;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::gateway::authorizer::{Authorizer, SimulatedAuthorizer};
use crate::gateway::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // Load configuration from environment
    let cfg = settings::Config::load();
    if let Err(e) = cfg.validate() {
        tracing::error!("invalid configuration: {e}");
        return Err(e);
    }
    tracing::info!("starting PayFlow gateway");

    let store = store::Store::open(&cfg.database_url)
        .with_context(|| format!("open store at {}", cfg.database_url))?;

    let authorizer: Arc<dyn Authorizer> =
        Arc::new(SimulatedAuthorizer::new(cfg.authorize_success_rate));
    let gw = Gateway::new(cfg, store, authorizer).context("build gateway state")?;

    // Webhook dispatcher fleet drains the outbox in the background.
    let workers = dispatcher::spawn_workers(&gw);
    tracing::info!(workers = workers.len(), "webhook dispatcher started");

    let addr = SocketAddr::from(([0, 0, 0, 0], gw.settings.server_port));
    let app = server::router(Arc::clone(&gw));
    tracing::info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for worker in workers {
        worker.abort();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
