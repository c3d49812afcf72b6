use super::error::EngineError;
use super::prompt::Conversation;
use crate::types::Usage;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// 7 random lowercase alphanumerics.
pub fn new_request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Final answer of a non-streaming Task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub content: String,
    pub usage: Usage,
}

/// What a streaming caller receives once the stream is open.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Finish(Usage),
    Error { message: String, kind: &'static str },
    Done,
}

pub type CompletionReceiver = oneshot::Receiver<Result<CompletionOutcome, EngineError>>;
pub type StreamReceiver = mpsc::UnboundedReceiver<StreamEvent>;
pub type StreamOpenReceiver = oneshot::Receiver<Result<StreamReceiver, EngineError>>;

/// Where a Task's result goes. Settles exactly once.
pub enum ResponseSink {
    Complete(Option<oneshot::Sender<Result<CompletionOutcome, EngineError>>>),
    Stream {
        opener: Option<oneshot::Sender<Result<StreamReceiver, EngineError>>>,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    },
}

impl ResponseSink {
    pub fn completion() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (ResponseSink::Complete(Some(tx)), rx)
    }

    pub fn stream() -> (Self, StreamOpenReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            ResponseSink::Stream {
                opener: Some(tx),
                events: None,
            },
            rx,
        )
    }

    /// The caller stopped waiting before the Task produced anything.
    pub fn is_abandoned(&self) -> bool {
        match self {
            ResponseSink::Complete(Some(tx)) => tx.is_closed(),
            ResponseSink::Stream {
                opener: Some(tx), ..
            } => tx.is_closed(),
            _ => false,
        }
    }

    pub fn is_stream_open(&self) -> bool {
        matches!(self, ResponseSink::Stream { events: Some(_), .. })
    }

    /// Hand the event channel to the caller. Further failures become error
    /// events instead of an error response.
    pub fn open_stream(&mut self) {
        if let ResponseSink::Stream { opener, events } = self {
            if let Some(opener) = opener.take() {
                let (tx, rx) = mpsc::unbounded_channel();
                if opener.send(Ok(rx)).is_err() {
                    debug!("Stream caller went away before the stream opened");
                }
                *events = Some(tx);
            }
        }
    }

    pub fn send(&self, event: StreamEvent) {
        if let ResponseSink::Stream {
            events: Some(tx), ..
        } = self
        {
            // A closed receiver means the caller disconnected; the Task still runs to the end.
            let _ = tx.send(event);
        }
    }

    pub fn complete(&mut self, outcome: CompletionOutcome) {
        if let ResponseSink::Complete(slot) = self {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Ok(outcome));
            }
        }
    }

    /// Finish a stream normally: finish chunk, then terminator.
    pub fn finish_stream(&mut self, usage: Usage) {
        self.send(StreamEvent::Finish(usage));
        self.send(StreamEvent::Done);
        if let ResponseSink::Stream { events, .. } = self {
            events.take();
        }
    }

    pub fn fail(&mut self, error: EngineError) {
        match self {
            ResponseSink::Complete(slot) => {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(Err(error));
                }
            }
            ResponseSink::Stream { opener, events } => {
                if let Some(opener) = opener.take() {
                    let _ = opener.send(Err(error));
                } else if let Some(tx) = events.take() {
                    let _ = tx.send(StreamEvent::Error {
                        message: error.to_string(),
                        kind: error.class().error_type(),
                    });
                    let _ = tx.send(StreamEvent::Done);
                }
            }
        }
    }
}

/// One caller's chat-completion request.
pub struct Task {
    pub id: String,
    pub conversation: Conversation,
    pub stream: bool,
    pub arrived_at: Instant,
    pub sink: ResponseSink,
}

impl Task {
    pub fn new(id: String, conversation: Conversation, stream: bool, sink: ResponseSink) -> Self {
        Self {
            id,
            conversation,
            stream,
            arrived_at: Instant::now(),
            sink,
        }
    }
}
