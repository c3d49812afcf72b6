use super::detector::DetectorState;
use super::envelope::EnvelopeParser;
use super::error::{EngineError, Result};
use super::finalizer;
use super::snapshot::SnapshotReader;
use super::task::{ResponseSink, StreamEvent};
use super::bounded;
use crate::backend::Backend;
use crate::config::Timings;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Iterations between page error checks.
const PAGE_ERROR_CHECK_EVERY: u64 = 10;

/// Tracks what a streaming caller has already received.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last_sent: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self) -> &str {
        &self.last_sent
    }

    /// The new suffix of `content`, if it strictly extends what was sent.
    /// Content that does not start with the sent text yields nothing.
    pub fn advance(&mut self, content: &str) -> Option<String> {
        if content.len() <= self.last_sent.len() {
            return None;
        }
        if !content.starts_with(&self.last_sent) {
            warn!(
                "Extracted content no longer extends the sent text ({} chars sent), not resending",
                self.last_sent.len()
            );
            return None;
        }
        let delta = content[self.last_sent.len()..].to_string();
        self.last_sent.push_str(&delta);
        Some(delta)
    }
}

/// Text that is safe to send mid-stream: a trailing run of whitespace and
/// backticks may still turn into the closing fence.
fn settled_prefix(content: &str) -> &str {
    content.trim_end_matches(|c: char| c == '`' || c.is_whitespace())
}

pub(super) struct DeltaStreamer<'a> {
    backend: Arc<dyn Backend>,
    reader: SnapshotReader,
    parser: &'a EnvelopeParser,
    timings: &'a Timings,
    req_id: &'a str,
    tracker: DeltaTracker,
    marker_seen: bool,
}

impl<'a> DeltaStreamer<'a> {
    pub fn new(
        backend: Arc<dyn Backend>,
        reader: SnapshotReader,
        parser: &'a EnvelopeParser,
        timings: &'a Timings,
        req_id: &'a str,
    ) -> Self {
        Self {
            backend,
            reader,
            parser,
            timings,
            req_id,
            tracker: DeltaTracker::new(),
            marker_seen: false,
        }
    }

    fn emit(&mut self, sink: &ResponseSink, content: &str) {
        if let Some(delta) = self.tracker.advance(content) {
            debug!("[{}] Sending delta ({} chars)", self.req_id, delta.len());
            sink.send(StreamEvent::Delta(delta));
        }
    }

    /// Poll the response region and send deltas until the detector reports
    /// `Done`. Returns everything that was sent.
    pub async fn run(
        &mut self,
        mut state_rx: watch::Receiver<DetectorState>,
        sink: &ResponseSink,
        deadline: Instant,
    ) -> Result<String> {
        let mut last_raw = String::new();
        let mut iteration: u64 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::OperationTimeout(self.timings.operation_timeout()));
            }
            iteration += 1;

            if iteration % PAGE_ERROR_CHECK_EVERY == 0 {
                self.check_page_error().await?;
            }

            let raw = self.reader.read().await;
            if raw != last_raw {
                if let Some(content) = self.parser.stream_content(&raw) {
                    if !self.marker_seen {
                        debug!("[{}] Start marker found", self.req_id);
                        self.marker_seen = true;
                    }
                    self.emit(sink, settled_prefix(&content));
                } else if self.marker_seen {
                    warn!("[{}] Start marker disappeared from response", self.req_id);
                }
                last_raw = raw;
            }

            let state = *state_rx.borrow_and_update();
            match state {
                DetectorState::Done => break,
                DetectorState::TimedOut => {
                    return Err(EngineError::OperationTimeout(self.timings.operation_timeout()))
                }
                _ => {
                    if state_rx.has_changed().is_err() {
                        return Err(EngineError::Internal(
                            "completion detector stopped".to_string(),
                        ));
                    }
                }
            }

            tokio::time::sleep(self.timings.stream_poll_interval()).await;
        }

        self.final_sync(sink).await?;
        Ok(self.tracker.last_sent().to_string())
    }

    async fn check_page_error(&self) -> Result<()> {
        let error = bounded(self.timings.strict_probe_timeout(), self.backend.page_error())
            .await?
            .flatten();
        match error {
            Some(message) => Err(EngineError::Upstream(message)),
            None => Ok(()),
        }
    }

    /// Send whatever arrived since the last poll. Without a start marker the
    /// finalized answer goes out as one delta. Nothing more is sent while the
    /// page shows an error.
    async fn final_sync(&mut self, sink: &ResponseSink) -> Result<()> {
        self.check_page_error().await?;
        let raw = self.reader.read().await;
        match self.parser.stream_content(&raw) {
            Some(content) => self.emit(sink, &content),
            None if self.tracker.last_sent().is_empty() => {
                let answer =
                    finalizer::finalize(&mut self.reader, self.parser, self.timings, self.req_id)
                        .await;
                if !answer.is_empty() {
                    info!(
                        "[{}] No start marker in stream, sending finalized answer",
                        self.req_id
                    );
                    self.emit(sink, &answer);
                }
            }
            None => warn!("[{}] Start marker missing in final snapshot", self.req_id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_follow_prefix_growth() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.advance("Hello").as_deref(), Some("Hello"));
        assert_eq!(tracker.advance("Hello"), None);
        assert_eq!(tracker.advance("Hello, world!").as_deref(), Some(", world!"));
        assert_eq!(tracker.last_sent(), "Hello, world!");
    }

    #[test]
    fn replaced_content_sends_nothing() {
        let mut tracker = DeltaTracker::new();
        tracker.advance("Hello there");
        assert_eq!(tracker.advance("Goodbye, everyone"), None);
        assert_eq!(tracker.advance("Hel"), None);
        assert_eq!(tracker.last_sent(), "Hello there");
        assert_eq!(tracker.advance("Hello there!").as_deref(), Some("!"));
    }

    #[test]
    fn sum_of_deltas_is_final_content() {
        let snapshots = ["", "a", "ab", "ab", "abc def", "abc def\nghi", "abc def\nghi jk"];
        let mut tracker = DeltaTracker::new();
        let sent: String = snapshots
            .iter()
            .filter_map(|s| tracker.advance(s))
            .collect();
        assert_eq!(sent, "abc def\nghi jk");
    }

    #[test]
    fn settled_prefix_holds_back_possible_fence() {
        assert_eq!(settled_prefix("Hello\n``"), "Hello");
        assert_eq!(settled_prefix("Hello "), "Hello");
        assert_eq!(settled_prefix("Hello"), "Hello");
    }
}
