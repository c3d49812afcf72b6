//! In-memory backend whose page evolves along a timeline relative to the
//! moment of submission. Uses tokio's clock so tests can run with paused time.

use super::{Backend, BackendError, Connector, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub struct ScriptedBackend {
    /// (offset after submit, text) pairs, sorted by offset.
    timeline: Mutex<Vec<(Duration, Option<String>)>>,
    busy_for: Mutex<Duration>,
    submitted_at: Mutex<Option<Instant>>,
    input: Mutex<String>,
    input_interactable: AtomicBool,
    page_error: Mutex<Option<String>>,
    connected: AtomicBool,
    responses: AtomicUsize,
    panic_on_fill: AtomicBool,
    submissions: Mutex<Vec<Instant>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            timeline: Mutex::new(Vec::new()),
            busy_for: Mutex::new(Duration::ZERO),
            submitted_at: Mutex::new(None),
            input: Mutex::new(String::new()),
            input_interactable: AtomicBool::new(true),
            page_error: Mutex::new(None),
            connected: AtomicBool::new(true),
            responses: AtomicUsize::new(0),
            panic_on_fill: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Response text becomes `text` at `at_ms` after submission.
    pub fn with_snapshot(self, at_ms: u64, text: &str) -> Self {
        {
            let mut timeline = self.timeline.lock().unwrap();
            timeline.push((Duration::from_millis(at_ms), Some(text.to_string())));
            timeline.sort_by_key(|(offset, _)| *offset);
        }
        self
    }

    /// Busy indicator stays visible for `ms` after submission.
    pub fn busy_for(self, ms: u64) -> Self {
        *self.busy_for.lock().unwrap() = Duration::from_millis(ms);
        self
    }

    pub fn with_page_error(self, message: &str) -> Self {
        *self.page_error.lock().unwrap() = Some(message.to_string());
        self
    }

    pub fn with_existing_responses(self, count: usize) -> Self {
        self.responses.store(count, Ordering::SeqCst);
        self
    }

    pub fn set_input_interactable(&self, value: bool) {
        self.input_interactable.store(value, Ordering::SeqCst);
    }

    /// The next `fill_input` panics, once.
    pub fn panic_on_next_fill(&self) {
        self.panic_on_fill.store(true, Ordering::SeqCst);
    }

    /// Times at which the submit control was clicked.
    pub fn submissions(&self) -> Vec<Instant> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn elapsed_since_submit(&self) -> Option<Duration> {
        self.submitted_at.lock().unwrap().map(|t| t.elapsed())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Disconnected("scripted session closed".into()))
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn is_input_interactable(&self) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.input_interactable.load(Ordering::SeqCst))
    }

    async fn fill_input(&self, text: &str) -> Result<()> {
        self.ensure_connected()?;
        if self.panic_on_fill.swap(false, Ordering::SeqCst) {
            panic!("scripted fill panic");
        }
        self.record(format!("fill:{text}"));
        *self.input.lock().unwrap() = text.to_string();
        Ok(())
    }

    async fn input_value(&self) -> Result<String> {
        self.ensure_connected()?;
        Ok(self.input.lock().unwrap().clone())
    }

    async fn is_submit_enabled(&self) -> Result<bool> {
        self.ensure_connected()?;
        Ok(!self.input.lock().unwrap().is_empty())
    }

    async fn click_submit(&self) -> Result<()> {
        self.ensure_connected()?;
        self.record("submit");
        self.input.lock().unwrap().clear();
        *self.submitted_at.lock().unwrap() = Some(Instant::now());
        self.submissions.lock().unwrap().push(Instant::now());
        self.responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        self.ensure_connected()?;
        let busy_for = *self.busy_for.lock().unwrap();
        Ok(self
            .elapsed_since_submit()
            .map_or(false, |elapsed| elapsed < busy_for))
    }

    async fn response_text(&self) -> Result<Option<String>> {
        self.ensure_connected()?;
        let Some(elapsed) = self.elapsed_since_submit() else {
            return Ok(None);
        };
        let timeline = self.timeline.lock().unwrap();
        Ok(timeline
            .iter()
            .take_while(|(offset, _)| *offset <= elapsed)
            .last()
            .and_then(|(_, text)| text.clone()))
    }

    async fn response_count(&self) -> Result<usize> {
        self.ensure_connected()?;
        Ok(self.responses.load(Ordering::SeqCst))
    }

    async fn page_error(&self) -> Result<Option<String>> {
        self.ensure_connected()?;
        Ok(self.page_error.lock().unwrap().clone())
    }

    async fn clear_conversation(&self) -> Result<()> {
        self.ensure_connected()?;
        self.record("clear");
        self.responses.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_diagnostic(&self, label: &str) -> Result<Vec<PathBuf>> {
        self.record(format!("diagnostic:{label}"));
        Ok(Vec::new())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out the same scripted backend, failing the first `failures` attempts.
pub struct ScriptedConnector {
    pub backend: Arc<ScriptedBackend>,
    pub failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(backend: Arc<ScriptedBackend>, failures: usize) -> Self {
        Self {
            backend,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Backend>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("scripted connection refused");
        }
        Ok(self.backend.clone())
    }
}
