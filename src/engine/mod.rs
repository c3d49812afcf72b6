//! Completion engine: drives one Task against the backend from submission to
//! the final answer or the last stream chunk.

mod detector;
pub mod envelope;
pub mod error;
mod finalizer;
pub mod prompt;
pub mod recorder;
pub mod snapshot;
mod streamer;
mod submitter;
pub mod supervisor;
pub mod task;


pub use detector::{CompletionDetector, DetectorState};
pub use envelope::{Envelope, EnvelopeParser};
pub use error::{EngineError, ErrorClass, Result};
pub use streamer::DeltaTracker;
pub use task::{CompletionOutcome, ResponseSink, StreamEvent, Task};

use crate::backend::{self, Backend};
use crate::config::{ConversationConfig, ProxyConfig, Timings};
use crate::types::Usage;
use recorder::{SharedRecording, SnapshotRecorder};
use snapshot::SnapshotReader;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(15);

/// Run one backend call under `limit`. Timeouts and ordinary failures read
/// as `None`; a lost session is an error.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<Option<T>>
where
    F: Future<Output = backend::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(e)) if e.is_disconnect() => Err(e.into()),
        Ok(Err(e)) => {
            debug!("Backend probe failed: {}", e);
            Ok(None)
        }
        Err(_) => Ok(None),
    }
}

/// Captures backend diagnostics at most once per label for one Task.
pub struct Diagnostics {
    backend: Arc<dyn Backend>,
    req_id: String,
    captured: Mutex<HashSet<&'static str>>,
}

impl Diagnostics {
    pub fn new(backend: Arc<dyn Backend>, req_id: &str) -> Self {
        Self {
            backend,
            req_id: req_id.to_string(),
            captured: Mutex::new(HashSet::new()),
        }
    }

    pub async fn capture(&self, label: &'static str) {
        let first = match self.captured.lock() {
            Ok(mut captured) => captured.insert(label),
            Err(_) => false,
        };
        if !first {
            return;
        }
        let name = format!("{}_{}", label, self.req_id);
        match tokio::time::timeout(DIAGNOSTIC_TIMEOUT, self.backend.capture_diagnostic(&name)).await
        {
            Ok(Ok(paths)) => info!("[{}] Saved diagnostics: {:?}", self.req_id, paths),
            Ok(Err(e)) => warn!("[{}] Diagnostic capture failed: {}", self.req_id, e),
            Err(_) => warn!("[{}] Diagnostic capture timed out", self.req_id),
        }
    }
}

pub struct Engine {
    timings: Timings,
    parser: EnvelopeParser,
    conversation: ConversationConfig,
    recorder: Option<Arc<SnapshotRecorder>>,
}

impl Engine {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            timings: config.timings.clone(),
            parser: EnvelopeParser::new(&config.envelope),
            conversation: config.conversation.clone(),
            recorder: config
                .recording
                .path
                .as_ref()
                .map(|path| Arc::new(SnapshotRecorder::new(path))),
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Time reserved after detection for the finalizer.
    fn finalize_reserve(&self) -> Duration {
        let t = &self.timings;
        (0..t.finalize_attempts)
            .map(|attempt| {
                t.snapshot_timeout() + t.finalize_backoff() + Duration::from_millis(500 * attempt as u64)
            })
            .sum()
    }

    fn reader(&self, backend: &Arc<dyn Backend>, recording: &Option<SharedRecording>) -> SnapshotReader {
        SnapshotReader::new(backend.clone(), self.timings.snapshot_timeout())
            .with_recording(recording.clone())
    }

    async fn page_error(&self, backend: &Arc<dyn Backend>) -> Result<Option<String>> {
        Ok(bounded(self.timings.strict_probe_timeout(), backend.page_error())
            .await?
            .flatten())
    }

    /// Submit, detect, extract. Writes the success result into the Task's
    /// sink; errors are left to the caller.
    pub async fn run(
        &self,
        backend: Arc<dyn Backend>,
        task: &mut Task,
        diagnostics: &Diagnostics,
        deadline: Instant,
    ) -> Result<()> {
        let prompt = task.conversation.backend_prompt(
            task.stream,
            self.parser.start_marker(),
            self.conversation.include_history,
        );

        let submitter = submitter::Submitter::new(&backend, &self.timings, &task.id);
        if task.conversation.is_new && self.conversation.clear_on_new_conversation {
            match submitter.clear_conversation().await {
                Ok(()) => {}
                Err(e @ EngineError::ConnectionLost(_)) => return Err(e),
                Err(e) => {
                    warn!("[{}] Could not clear conversation: {}", task.id, e);
                    diagnostics.capture("clear_chat").await;
                }
            }
        }
        submitter.submit(&prompt).await?;

        let recording: Option<SharedRecording> = self
            .recorder
            .as_ref()
            .map(|r| Arc::new(Mutex::new(r.start(&task.id, task.stream, &prompt))));

        let result = if task.stream {
            self.stream_response(&backend, task, &prompt, &recording, diagnostics, deadline)
                .await
        } else {
            // Leave the finalizer its retry budget before the global deadline.
            let detection_deadline = deadline
                .checked_sub(self.finalize_reserve())
                .filter(|d| *d > Instant::now())
                .unwrap_or(deadline);
            self.complete_response(&backend, task, &prompt, &recording, diagnostics, detection_deadline)
                .await
        };

        if let (Some(recorder), Some(recording)) = (&self.recorder, &recording) {
            match recording.lock() {
                Ok(recording) => {
                    if let Err(e) = recorder.finish(&recording) {
                        warn!("[{}] Failed to write snapshot recording: {:#}", task.id, e);
                    }
                }
                Err(_) => warn!("[{}] Snapshot recording lock poisoned", task.id),
            }
        }

        result
    }

    async fn complete_response(
        &self,
        backend: &Arc<dyn Backend>,
        task: &mut Task,
        prompt: &str,
        recording: &Option<SharedRecording>,
        diagnostics: &Diagnostics,
        detection_deadline: Instant,
    ) -> Result<()> {
        let (state_tx, _state_rx) = watch::channel(DetectorState::Busy);
        let mut detector = CompletionDetector::new(
            backend.clone(),
            self.reader(backend, recording),
            self.parser.clone(),
            self.timings.clone(),
            &task.id,
        );
        if detector.run(detection_deadline, state_tx).await? == DetectorState::TimedOut {
            warn!("[{}] Completion not confirmed in time, extracting anyway", task.id);
            diagnostics.capture("detection_timeout").await;
        }

        if let Some(message) = self.page_error(backend).await? {
            return Err(EngineError::Upstream(message));
        }

        let mut reader = self.reader(backend, recording);
        let answer =
            finalizer::finalize(&mut reader, &self.parser, &self.timings, &task.id).await;
        if answer.is_empty() {
            if let Some(message) = self.page_error(backend).await? {
                return Err(EngineError::Upstream(message));
            }
            warn!("[{}] Final answer is empty", task.id);
        }

        info!("[{}] Final answer ready ({} chars)", task.id, answer.len());
        let usage = Usage::estimate(prompt, &answer);
        task.sink.complete(CompletionOutcome {
            content: answer,
            usage,
        });
        Ok(())
    }

    /// Detection and streaming both run until the global deadline.
    async fn stream_response(
        &self,
        backend: &Arc<dyn Backend>,
        task: &mut Task,
        prompt: &str,
        recording: &Option<SharedRecording>,
        diagnostics: &Diagnostics,
        deadline: Instant,
    ) -> Result<()> {
        task.sink.open_stream();

        let (state_tx, state_rx) = watch::channel(DetectorState::Busy);
        let mut detector = CompletionDetector::new(
            backend.clone(),
            self.reader(backend, recording),
            self.parser.clone(),
            self.timings.clone(),
            &task.id,
        );
        let mut streamer = streamer::DeltaStreamer::new(
            backend.clone(),
            self.reader(backend, recording),
            &self.parser,
            &self.timings,
            &task.id,
        );

        let (detected, streamed) = tokio::join!(
            detector.run(deadline, state_tx),
            streamer.run(state_rx, &task.sink, deadline)
        );
        detected?;
        let sent = match streamed {
            Ok(sent) => sent,
            Err(e) => {
                if matches!(e, EngineError::Upstream(_)) {
                    diagnostics.capture("page_error").await;
                }
                return Err(e);
            }
        };

        if sent.is_empty() {
            if let Some(message) = self.page_error(backend).await? {
                return Err(EngineError::Upstream(message));
            }
            warn!("[{}] Stream finished without content", task.id);
        }

        info!("[{}] Stream complete ({} chars)", task.id, sent.len());
        task.sink.finish_stream(Usage::estimate(prompt, &sent));
        Ok(())
    }
}
