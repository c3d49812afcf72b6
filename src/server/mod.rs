//! OpenAI-compatible HTTP surface.

mod error;
mod routes;
mod sse;

#[cfg(test)]
mod tests;

pub use error::ApiError;

use crate::backend::BackendHandle;
use crate::queue::RequestQueue;
use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub queue: RequestQueue,
    pub backend: BackendHandle,
    pub model_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/models", get(routes::list_models))
        .route("/health", get(routes::health))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, router(state))
        .await
        .context("HTTP server failed")
}
