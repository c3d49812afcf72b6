use super::bounded;
use super::error::{EngineError, Result};
use crate::backend::{self, Backend};
use crate::config::Timings;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Puts a prompt into the backend's input surface and submits it. Never
/// retries: a second submission could duplicate the Task.
pub(super) struct Submitter<'a> {
    backend: &'a Arc<dyn Backend>,
    timings: &'a Timings,
    req_id: &'a str,
}

impl<'a> Submitter<'a> {
    pub fn new(backend: &'a Arc<dyn Backend>, timings: &'a Timings, req_id: &'a str) -> Self {
        Self {
            backend,
            timings,
            req_id,
        }
    }

    /// Poll `check` until it reports true or `limit` passes.
    async fn wait_until<F, Fut>(&self, what: &str, limit: Duration, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = backend::Result<bool>>,
    {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe_limit = remaining.min(self.timings.strict_probe_timeout());
            if bounded(probe_limit, check()).await? == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Interaction(format!(
                    "{} not ready within {}ms",
                    what,
                    limit.as_millis()
                )));
            }
            tokio::time::sleep(self.timings.probe_timeout().min(remaining)).await;
        }
    }

    /// Run a single action under `limit`; any failure is an interaction error.
    async fn act<Fut>(&self, what: &str, limit: Duration, action: Fut) -> Result<()>
    where
        Fut: Future<Output = backend::Result<()>>,
    {
        match tokio::time::timeout(limit, action).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_disconnect() => Err(e.into()),
            Ok(Err(e)) => Err(EngineError::Interaction(format!("{} failed: {}", what, e))),
            Err(_) => Err(EngineError::Interaction(format!(
                "{} timed out after {}ms",
                what,
                limit.as_millis()
            ))),
        }
    }

    pub async fn submit(&self, prompt: &str) -> Result<()> {
        self.wait_until("input surface", self.timings.input_ready_timeout(), || {
            self.backend.is_input_interactable()
        })
        .await?;

        debug!("[{}] Filling prompt ({} chars)", self.req_id, prompt.len());
        self.act("filling the input", self.timings.fill_timeout(), self.backend.fill_input(prompt))
            .await?;

        self.wait_until("submit control", self.timings.submit_ready_timeout(), || {
            self.backend.is_submit_enabled()
        })
        .await?;

        self.act("clicking submit", self.timings.click_timeout(), self.backend.click_submit())
            .await?;
        info!("[{}] Prompt submitted", self.req_id);
        Ok(())
    }

    /// Ask the backend for a fresh conversation and wait for the response
    /// region to empty.
    pub async fn clear_conversation(&self) -> Result<()> {
        let limit = self.timings.clear_chat_timeout();
        self.act("clearing the conversation", limit, self.backend.clear_conversation())
            .await?;
        self.wait_until("empty conversation", limit, || async {
            self.backend.response_count().await.map(|count| count == 0)
        })
        .await?;
        info!("[{}] Conversation cleared", self.req_id);
        Ok(())
    }
}
