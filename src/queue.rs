//! Single-worker request queue. Tasks run strictly in arrival order and only
//! the running Task touches the backend.

use crate::backend::BackendHandle;
use crate::engine::supervisor::supervise;
use crate::engine::{Engine, EngineError, ErrorClass, Task};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl RequestQueue {
    /// Spawn the worker and return a handle for enqueueing.
    pub fn start(engine: Arc<Engine>, backend: BackendHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_worker(
            rx,
            engine,
            backend,
            pending.clone(),
            running.clone(),
        ));

        Self {
            tx,
            pending,
            running,
        }
    }

    pub fn enqueue(&self, task: Task) -> Result<(), EngineError> {
        let id = task.id.clone();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Internal("request queue is not running".to_string()));
        }
        debug!("[{}] Enqueued ({} pending)", id, self.len());
        Ok(())
    }

    /// Tasks waiting to run, not counting the running one.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Task>,
    engine: Arc<Engine>,
    backend: BackendHandle,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    info!("Request queue worker started");
    let mut last_stream_end: Option<Instant> = None;

    while let Some(mut task) = rx.recv().await {
        pending.fetch_sub(1, Ordering::SeqCst);
        if task.sink.is_abandoned() {
            info!("[{}] Caller went away while queued, skipping", task.id);
            continue;
        }
        running.store(true, Ordering::SeqCst);

        if task.stream {
            if let Some(ended) = last_stream_end {
                let ready_at = ended + engine.timings().stream_cooldown();
                if Instant::now() < ready_at {
                    debug!("[{}] Waiting for stream cooldown", task.id);
                    tokio::time::sleep_until(ready_at).await;
                }
            }
        }

        match backend.current().await {
            None => {
                warn!("[{}] Backend not connected, failing task", task.id);
                task.sink.fail(EngineError::ConnectionLost(
                    "backend is not connected".to_string(),
                ));
            }
            Some(session) => {
                let id = task.id.clone();
                let stream = task.stream;
                let outcome = AssertUnwindSafe(supervise(&engine, session, task))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Err(ErrorClass::Unavailable)) => backend.invalidate().await,
                    Ok(_) => {}
                    Err(_) => error!("[{}] Task panicked, advancing queue", id),
                }
                if stream {
                    last_stream_end = Some(Instant::now());
                }
            }
        }

        running.store(false, Ordering::SeqCst);
    }
    info!("Request queue worker stopped");
}
