use super::*;
use crate::backend::scripted::ScriptedBackend;
use crate::config::{ProxyConfig, Timings};
use crate::engine::Engine;
use serde_json::{json, Value};
use std::sync::Arc;

fn fast_timings() -> Timings {
    Timings {
        operation_timeout: 5000,
        poll_interval: 10,
        stream_poll_interval: 10,
        probe_timeout: 50,
        strict_probe_timeout: 50,
        settle_delay: 20,
        silence_duration: 100,
        input_ready_timeout: 500,
        fill_timeout: 500,
        submit_ready_timeout: 500,
        click_timeout: 500,
        snapshot_timeout: 100,
        finalize_attempts: 2,
        finalize_backoff: 20,
        clear_chat_timeout: 200,
        stream_cooldown: 10,
        reconnect_interval: 50,
    }
}

/// Serve the proxy on an ephemeral port and return its base URL.
async fn spawn_proxy(backend: Option<Arc<ScriptedBackend>>) -> String {
    let mut config = ProxyConfig::default();
    config.timings = fast_timings();

    let handle = match backend {
        Some(backend) => BackendHandle::with_backend(backend),
        None => BackendHandle::new(),
    };
    let engine = Arc::new(Engine::new(&config));
    let state = AppState {
        queue: RequestQueue::start(engine, handle.clone()),
        backend: handle,
        model_name: config.server.model_name.clone(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    format!("http://{}", addr)
}

fn hello_backend() -> Arc<ScriptedBackend> {
    Arc::new(
        ScriptedBackend::new()
            .busy_for(100)
            .with_snapshot(20, "```\n<<<START_RESPONSE>>>Hello")
            .with_snapshot(60, "```\n<<<START_RESPONSE>>>Hello, world!\n```"),
    )
}

fn user_message(stream: bool) -> Value {
    json!({
        "model": "anything",
        "stream": stream,
        "messages": [{"role": "user", "content": "Say hello"}]
    })
}

#[tokio::test]
async fn models_lists_configured_model() {
    let base = spawn_proxy(Some(hello_backend())).await;
    let body: Value = reqwest::get(format!("{}/v1/models", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "google-ai-studio-via-browser");
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn health_reflects_backend_connection() {
    let base = spawn_proxy(Some(hello_backend())).await;
    let response = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["backend_connected"], true);
    assert_eq!(body["queue_length"], 0);

    let base = spawn_proxy(None).await;
    let response = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "Error");
    assert_eq!(body["backend_connected"], false);
}

#[tokio::test]
async fn chat_without_backend_is_rejected_with_retry_hint() {
    let dead = hello_backend();
    dead.disconnect();
    let base = spawn_proxy(Some(dead.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .json(&user_message(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("30")
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert!(dead.calls().is_empty());
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let base = spawn_proxy(Some(hello_backend())).await;
    let client = reqwest::Client::new();
    let url = format!("{}/v1/chat/completions", base);

    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .post(&url)
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = client
        .post(&url)
        .json(&json!({"messages": [{"role": "system", "content": "be brief"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn non_streaming_completion_returns_answer() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .busy_for(100)
            .with_snapshot(50, r#"{"response":"<<<START_RESPONSE>>>The capital of France is Paris."}"#),
    );
    let base = spawn_proxy(Some(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .json(&user_message(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["model"], "google-ai-studio-via-browser");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "The capital of France is Paris."
    );
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn streaming_completion_sends_chunks_then_done() {
    let base = spawn_proxy(Some(hello_backend())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .json(&user_message(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("text/event-stream")));

    let body = response.text().await.unwrap();
    let payloads: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello, world!");

    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert!(last["usage"]["total_tokens"].as_u64().unwrap() > 0);
    assert!(chunks
        .iter()
        .all(|c| c["object"] == "chat.completion.chunk"));
}
