//! The single interactive backend the proxy drives.
//!
//! The engine only ever talks to [`Backend`]; how the session was found or
//! launched is the business of a [`Connector`].

mod chrome;
mod error;
pub mod selectors;

#[cfg(test)]
pub mod scripted;

pub use chrome::ChromeConnector;
pub use error::{BackendError, Result};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Queryable surface of the backend UI.
///
/// Every call is a single short observation or action. Callers put their
/// own time bounds around these calls; implementations should not retry.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether the input surface is attached, visible and editable.
    async fn is_input_interactable(&self) -> Result<bool>;

    /// Replace the whole content of the input surface.
    async fn fill_input(&self, text: &str) -> Result<()>;

    /// Current content of the input surface.
    async fn input_value(&self) -> Result<String>;

    async fn is_submit_enabled(&self) -> Result<bool>;

    async fn click_submit(&self) -> Result<()>;

    /// Whether the busy indicator is currently visible.
    async fn is_busy(&self) -> Result<bool>;

    /// Full text of the latest response region, `None` when no region exists yet.
    async fn response_text(&self) -> Result<Option<String>>;

    /// Number of response regions currently rendered.
    async fn response_count(&self) -> Result<usize>;

    /// Error message the backend is showing to its user, if any.
    async fn page_error(&self) -> Result<Option<String>>;

    /// Start a fresh conversation on the backend.
    async fn clear_conversation(&self) -> Result<()>;

    /// Best-effort screenshot/markup capture. Returns the written paths.
    async fn capture_diagnostic(&self, label: &str) -> Result<Vec<PathBuf>>;

    fn is_connected(&self) -> bool;
}

/// Establishes a backend session. Used for the initial connection and
/// every reconnection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Backend>>;
}

/// Reconnectable, process-wide backend slot.
///
/// Only the request queue's running task reads the backend out of it; the
/// HTTP layer only asks whether it is available.
#[derive(Clone, Default)]
pub struct BackendHandle {
    slot: Arc<RwLock<Option<Arc<dyn Backend>>>>,
}

impl BackendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(backend))),
        }
    }

    /// The installed backend, as long as it still reports a live session.
    pub async fn current(&self) -> Option<Arc<dyn Backend>> {
        let guard = self.slot.read().await;
        guard.as_ref().filter(|b| b.is_connected()).cloned()
    }

    pub async fn is_available(&self) -> bool {
        self.current().await.is_some()
    }

    pub async fn install(&self, backend: Arc<dyn Backend>) {
        *self.slot.write().await = Some(backend);
        info!("Backend session installed");
    }

    /// Mark the backend unusable until a reconnection installs a new one.
    pub async fn invalidate(&self) {
        let mut guard = self.slot.write().await;
        if guard.take().is_some() {
            warn!("Backend session invalidated");
        }
    }

    /// Keep the slot filled: whenever the backend is missing or dead, ask the
    /// connector for a new session every `interval`.
    pub async fn run_reconnect_loop(
        self,
        connector: Arc<dyn Connector>,
        interval: std::time::Duration,
    ) {
        loop {
            if !self.is_available().await {
                self.invalidate().await;
                info!("Backend unavailable, attempting to connect...");
                match connector.connect().await {
                    Ok(backend) => self.install(backend).await,
                    Err(e) => warn!("Backend connection attempt failed: {:#}", e),
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{ScriptedBackend, ScriptedConnector};
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_installs_backend_after_failures() {
        let backend = Arc::new(ScriptedBackend::new());
        let connector = Arc::new(ScriptedConnector::new(backend.clone(), 2));
        let handle = BackendHandle::new();
        assert!(!handle.is_available().await);

        tokio::spawn(
            handle
                .clone()
                .run_reconnect_loop(connector.clone(), Duration::from_millis(100)),
        );
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(handle.is_available().await);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_session_is_replaced() {
        let dead = Arc::new(ScriptedBackend::new());
        dead.disconnect();
        let fresh = Arc::new(ScriptedBackend::new());
        let handle = BackendHandle::with_backend(dead);
        assert!(handle.current().await.is_none());

        let connector = Arc::new(ScriptedConnector::new(fresh, 0));
        tokio::spawn(
            handle
                .clone()
                .run_reconnect_loop(connector, Duration::from_millis(100)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_available().await);
    }
}
