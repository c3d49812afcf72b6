use super::error::ApiError;
use super::sse::completion_stream;
use super::AppState;
use crate::engine::prompt;
use crate::engine::task::new_request_id;
use crate::engine::{ResponseSink, Task};
use crate::types::{ChatCompletion, ChatCompletionRequest, HealthStatus, ModelList};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{info, warn};

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let req_id = new_request_id();
    info!(
        "[{}] Chat completion request ({} messages, stream={})",
        req_id,
        request.messages.len(),
        request.stream
    );

    let conversation = prompt::validate(&req_id, &request.messages)?;

    if !state.backend.is_available().await {
        warn!("[{}] Rejected: backend not connected", req_id);
        return Err(ApiError::unavailable(
            "Backend connection is not available, try again later",
        ));
    }

    let created = chrono::Utc::now().timestamp();
    let completion_id = format!("chatcmpl-{}-{}", req_id, created);
    let model = state.model_name.clone();

    if request.stream {
        let (sink, opened) = ResponseSink::stream();
        state
            .queue
            .enqueue(Task::new(req_id, conversation, true, sink))?;
        let events = opened
            .await
            .map_err(|_| ApiError::internal("Task ended before the stream opened"))??;
        Ok(completion_stream(events, completion_id, created, model).into_response())
    } else {
        let (sink, settled) = ResponseSink::completion();
        state
            .queue
            .enqueue(Task::new(req_id, conversation, false, sink))?;
        let outcome = settled
            .await
            .map_err(|_| ApiError::internal("Task ended without a result"))??;
        Ok(Json(ChatCompletion::new(
            completion_id,
            created,
            &model,
            outcome.content,
            outcome.usage,
        ))
        .into_response())
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::single(
        &state.model_name,
        chrono::Utc::now().timestamp(),
    ))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let connected = state.backend.is_available().await;
    let status = HealthStatus {
        status: if connected { "OK" } else { "Error" }.to_string(),
        queue_length: state.queue.len(),
        busy: state.queue.is_busy(),
        backend_connected: connected,
    };
    let code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
