use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend session disconnected: {0}")]
    Disconnected(String),

    #[error("Element not found: {0}")]
    ElementMissing(String),

    #[error("Backend operation timed out: {0}")]
    Timeout(String),

    #[error("DevTools protocol error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),

    #[error("Page script error: {0}")]
    Script(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True when the session itself is gone, not just one element or call.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BackendError::Disconnected(_) => true,
            BackendError::Cdp(e) => {
                let message = e.to_string().to_lowercase();
                message.contains("channel closed")
                    || message.contains("connection closed")
                    || message.contains("websocket")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
