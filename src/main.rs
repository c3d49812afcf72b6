mod backend;
mod cli;
mod config;
mod engine;
mod logging;
mod queue;
mod server;
mod types;

use crate::backend::{BackendHandle, ChromeConnector, Connector};
use crate::cli::Args;
use crate::config::ProxyConfig;
use crate::engine::Engine;
use crate::queue::RequestQueue;
use crate::server::AppState;
use anyhow::{Context, Result};
use clap::Parser;
use logging::setup_logging;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    setup_logging(args.verbose, args.log_file.clone());

    let mut config = ProxyConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    args.apply_to(&mut config);
    info!(
        "Starting studio-proxy (model '{}', browser {})",
        config.server.model_name, config.browser.endpoint
    );

    let connector: Arc<dyn Connector> = Arc::new(ChromeConnector::new(
        config.browser.endpoint.clone(),
        config.browser.target_url.clone(),
        config.browser.url_pattern.clone(),
        config.browser.diagnostics_dir.clone(),
    ));
    let backend = BackendHandle::new();
    tokio::spawn(
        backend
            .clone()
            .run_reconnect_loop(connector, config.timings.reconnect_interval()),
    );

    let engine = Arc::new(Engine::new(&config));
    let queue = RequestQueue::start(engine, backend.clone());
    let state = AppState {
        queue,
        backend,
        model_name: config.server.model_name.clone(),
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    server::serve(listener, state).await
}
