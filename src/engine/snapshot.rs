use super::recorder::SharedRecording;
use crate::backend::Backend;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// UI chrome that leaks into the response region's text. Always rendered on
/// a line of its own.
static UI_JUNK: OnceLock<Option<Regex>> = OnceLock::new();

fn ui_junk() -> Option<&'static Regex> {
    UI_JUNK
        .get_or_init(|| {
            Regex::new(
                r"(?m)^[ \t]*(?:IGNORE_WHEN_COPYING_START|IGNORE_WHEN_COPYING_END|content_copy|download|Use code with caution\.)[ \t]*(?:\r?\n|\z)",
            )
            .ok()
        })
        .as_ref()
}

/// Drop lines that hold nothing but a UI chrome token. Answer lines are
/// left untouched, so a growing answer keeps growing by appending.
pub fn clean_snapshot(text: &str) -> String {
    match ui_junk() {
        Some(pattern) => pattern.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Reads the latest response region text, tolerating transient absence by
/// returning the previous value.
pub struct SnapshotReader {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    last: String,
    recording: Option<SharedRecording>,
}

impl SnapshotReader {
    pub fn new(backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            last: String::new(),
            recording: None,
        }
    }

    pub fn with_recording(mut self, recording: Option<SharedRecording>) -> Self {
        self.recording = recording;
        self
    }

    fn store(&mut self, text: &str) {
        self.last = clean_snapshot(text);
        if let Some(recording) = &self.recording {
            if let Ok(mut recording) = recording.lock() {
                recording.record(&self.last);
            }
        }
    }

    pub async fn read(&mut self) -> String {
        match tokio::time::timeout(self.timeout, self.backend.response_text()).await {
            Ok(Ok(Some(text))) => self.store(&text),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!("Snapshot read failed, keeping previous: {}", e),
            Err(_) => debug!("Snapshot read timed out, keeping previous"),
        }
        self.last.clone()
    }

    /// Read without falling back to the previous value.
    pub async fn read_fresh(&mut self) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.backend.response_text()).await {
            Ok(Ok(Some(text))) => {
                self.store(&text);
                Some(self.last.clone())
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!("Snapshot read failed: {}", e);
                None
            }
            Err(_) => {
                debug!("Snapshot read timed out");
                None
            }
        }
    }
}
