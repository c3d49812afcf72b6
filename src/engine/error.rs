use crate::backend::BackendError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The input or submit surface could not be driven in time.
    #[error("Backend interaction failed: {0}")]
    Interaction(String),

    #[error("Backend reported an error: {0}")]
    Upstream(String),

    #[error("Operation timed out after {}s", .0.as_secs())]
    OperationTimeout(Duration),

    #[error("Backend connection lost: {0}")]
    ConnectionLost(String),

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BackendError> for EngineError {
    fn from(e: BackendError) -> Self {
        if e.is_disconnect() {
            EngineError::ConnectionLost(e.to_string())
        } else {
            EngineError::Backend(e)
        }
    }
}

/// Coarse classification used for HTTP status mapping and for limiting
/// diagnostics to one capture per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    InvalidRequest,
    Upstream,
    Unavailable,
    Timeout,
    Server,
}

impl ErrorClass {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorClass::InvalidRequest => 400,
            ErrorClass::Upstream => 502,
            ErrorClass::Unavailable => 503,
            ErrorClass::Timeout => 504,
            ErrorClass::Server => 500,
        }
    }

    pub fn error_type(self) -> &'static str {
        match self {
            ErrorClass::InvalidRequest => "invalid_request_error",
            ErrorClass::Upstream => "upstream_error",
            ErrorClass::Unavailable => "service_unavailable",
            ErrorClass::Timeout => "timeout_error",
            ErrorClass::Server => "server_error",
        }
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidRequest(_) => ErrorClass::InvalidRequest,
            EngineError::Interaction(_) | EngineError::Upstream(_) | EngineError::Backend(_) => {
                ErrorClass::Upstream
            }
            EngineError::OperationTimeout(_) => ErrorClass::Timeout,
            EngineError::ConnectionLost(_) => ErrorClass::Unavailable,
            EngineError::Internal(_) => ErrorClass::Server,
        }
    }

    /// Short label for diagnostic file names.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Interaction(_) => "interaction",
            EngineError::Upstream(_) => "upstream",
            EngineError::OperationTimeout(_) => "timeout",
            EngineError::ConnectionLost(_) => "connection_lost",
            EngineError::Backend(_) => "backend",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
