use super::envelope::EnvelopeParser;
use super::error::{EngineError, Result};
use super::snapshot::SnapshotReader;
use super::bounded;
use crate::backend::Backend;
use crate::config::Timings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Busy,
    PotentiallyDone,
    Confirming,
    Done,
    TimedOut,
}

impl DetectorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DetectorState::Done | DetectorState::TimedOut)
    }

    fn can_advance_to(self, next: DetectorState) -> bool {
        use DetectorState::*;
        match (self, next) {
            (Done, _) | (TimedOut, _) => false,
            (_, TimedOut) => true,
            (Busy, PotentiallyDone) => true,
            (PotentiallyDone, Confirming) | (PotentiallyDone, Busy) => true,
            (Confirming, Done) | (Confirming, Busy) => true,
            _ => false,
        }
    }
}

enum Silence {
    Reached,
    DeadlinePassed,
}

/// Decides when the backend has finished generating. No single signal is
/// trusted: the busy indicator must be hidden, the input empty and the
/// submit control disabled, twice, followed by a period without text change.
pub struct CompletionDetector {
    backend: Arc<dyn Backend>,
    reader: SnapshotReader,
    parser: EnvelopeParser,
    timings: Timings,
    req_id: String,
    state: DetectorState,
    transitions: Vec<DetectorState>,
}

impl CompletionDetector {
    pub fn new(
        backend: Arc<dyn Backend>,
        reader: SnapshotReader,
        parser: EnvelopeParser,
        timings: Timings,
        req_id: &str,
    ) -> Self {
        Self {
            backend,
            reader,
            parser,
            timings,
            req_id: req_id.to_string(),
            state: DetectorState::Busy,
            transitions: vec![DetectorState::Busy],
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[DetectorState] {
        &self.transitions
    }

    /// Move to `next` if the state machine allows it.
    pub fn advance(&mut self, next: DetectorState) -> bool {
        if !self.state.can_advance_to(next) {
            debug!(
                "[{}] Ignoring detector transition {:?} -> {:?}",
                self.req_id, self.state, next
            );
            return false;
        }
        debug!("[{}] Detector {:?} -> {:?}", self.req_id, self.state, next);
        self.state = next;
        self.transitions.push(next);
        true
    }

    fn observed_content(&self, raw: &str) -> String {
        self.parser
            .stream_content(raw)
            .unwrap_or_else(|| raw.to_string())
    }

    /// Busy indicator hidden, input empty, submit disabled. Each probe gets
    /// its own `limit`; a failed or slow probe counts as "not idle".
    async fn idle_signals(&self, limit: Duration) -> Result<bool> {
        let busy = bounded(limit, self.backend.is_busy()).await?;
        if busy != Some(false) {
            return Ok(false);
        }
        let input = bounded(limit, self.backend.input_value()).await?;
        if !input.map_or(false, |v| v.trim().is_empty()) {
            return Ok(false);
        }
        let submit_enabled = bounded(limit, self.backend.is_submit_enabled()).await?;
        Ok(submit_enabled == Some(false))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.backend.is_connected() {
            Ok(())
        } else {
            Err(EngineError::ConnectionLost(
                "backend disconnected during completion detection".to_string(),
            ))
        }
    }

    async fn await_silence(&mut self, deadline: Instant) -> Result<Silence> {
        let raw = self.reader.read().await;
        let mut last_content = self.observed_content(&raw);
        let mut last_change = Instant::now();

        loop {
            if Instant::now() >= deadline {
                return Ok(Silence::DeadlinePassed);
            }
            tokio::time::sleep(self.timings.poll_interval()).await;
            self.ensure_connected()?;

            let raw = self.reader.read().await;
            let content = self.observed_content(&raw);
            if content != last_content {
                debug!("[{}] Text still changing, silence timer reset", self.req_id);
                last_content = content;
                last_change = Instant::now();
            } else if last_change.elapsed() >= self.timings.silence_duration() {
                return Ok(Silence::Reached);
            }
        }
    }

    /// Run until `Done`, or `TimedOut` once `deadline` passes. Every state
    /// change is published on `state_tx`.
    pub async fn run(
        &mut self,
        deadline: Instant,
        state_tx: watch::Sender<DetectorState>,
    ) -> Result<DetectorState> {
        loop {
            if self.state.is_terminal() {
                return Ok(self.state);
            }
            if Instant::now() >= deadline {
                warn!("[{}] Completion detection deadline reached", self.req_id);
                self.advance(DetectorState::TimedOut);
                state_tx.send_replace(self.state);
                continue;
            }
            self.ensure_connected()?;

            match self.state {
                DetectorState::Busy => {
                    if self.idle_signals(self.timings.probe_timeout()).await? {
                        self.advance(DetectorState::PotentiallyDone);
                    } else {
                        tokio::time::sleep(self.timings.poll_interval()).await;
                    }
                }
                DetectorState::PotentiallyDone => {
                    tokio::time::sleep(self.timings.settle_delay()).await;
                    self.advance(DetectorState::Confirming);
                }
                DetectorState::Confirming => {
                    if !self.idle_signals(self.timings.strict_probe_timeout()).await? {
                        debug!("[{}] Idle signals did not hold, back to busy", self.req_id);
                        self.advance(DetectorState::Busy);
                    } else if let Silence::Reached = self.await_silence(deadline).await? {
                        info!("[{}] Completion confirmed", self.req_id);
                        self.advance(DetectorState::Done);
                    }
                }
                DetectorState::Done | DetectorState::TimedOut => {}
            }
            state_tx.send_replace(self.state);
        }
    }
}
