use crate::engine::task::StreamReceiver;
use crate::engine::StreamEvent;
use crate::types::{ChatCompletionChunk, ErrorBody};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};

/// Render one engine event as an SSE `data:` line.
fn render(id: &str, created: i64, model: &str, event: StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Delta(text) => {
            Event::default().json_data(ChatCompletionChunk::content(id, created, model, text))
        }
        StreamEvent::Finish(usage) => {
            Event::default().json_data(ChatCompletionChunk::finish(id, created, model, usage))
        }
        StreamEvent::Error { message, kind } => {
            Event::default().json_data(ErrorBody::new(message, kind))
        }
        StreamEvent::Done => Ok(Event::default().data("[DONE]")),
    }
}

/// Events until `Done`. A channel that closes early still ends with an error
/// event and the terminator.
fn until_done(events: StreamReceiver) -> impl Stream<Item = StreamEvent> {
    stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        match events.recv().await {
            Some(StreamEvent::Done) => Some((vec![StreamEvent::Done], None)),
            Some(event) => Some((vec![event], Some(events))),
            None => Some((
                vec![
                    StreamEvent::Error {
                        message: "Stream ended unexpectedly".to_string(),
                        kind: "server_error",
                    },
                    StreamEvent::Done,
                ],
                None,
            )),
        }
    })
    .flat_map(stream::iter)
}

pub fn completion_stream(
    events: StreamReceiver,
    id: String,
    created: i64,
    model: String,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = until_done(events).map(move |event| render(&id, created, &model, event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
