//! Top-level handler for one Task: the only place that turns an error into
//! a response.

use super::{Diagnostics, Engine, EngineError, ErrorClass, Task};
use crate::backend::Backend;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info};

fn diagnostic_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::InvalidRequest => "invalid_request",
        ErrorClass::Upstream => "upstream_error",
        ErrorClass::Unavailable => "connection_error",
        ErrorClass::Timeout => "timeout",
        ErrorClass::Server => "server_error",
    }
}

/// Run `task` to completion under the global deadline and settle its sink.
/// Returns the failure class when the Task failed.
pub async fn supervise(
    engine: &Engine,
    backend: Arc<dyn Backend>,
    mut task: Task,
) -> Result<(), ErrorClass> {
    let limit = engine.timings().operation_timeout();
    let deadline = Instant::now() + limit;
    let diagnostics = Diagnostics::new(backend.clone(), &task.id);
    info!(
        "[{}] Processing (stream={}, waited {}ms in queue)",
        task.id,
        task.stream,
        task.arrived_at.elapsed().as_millis()
    );

    let result = match tokio::time::timeout_at(
        deadline,
        engine.run(backend, &mut task, &diagnostics, deadline),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(EngineError::OperationTimeout(limit)),
    };

    match result {
        Ok(()) => {
            info!("[{}] Completed", task.id);
            Ok(())
        }
        Err(e) => {
            let class = e.class();
            error!(
                "[{}] Failed ({}, stream open: {}): {}",
                task.id,
                e.label(),
                task.sink.is_stream_open(),
                e
            );
            if !matches!(class, ErrorClass::InvalidRequest | ErrorClass::Unavailable) {
                diagnostics.capture(diagnostic_label(class)).await;
            }
            task.sink.fail(e);
            Err(class)
        }
    }
}
