//! HTTP runner against a local streaming chat-completions stub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_gateway::runner::http::{HttpRunner, HttpRunnerConfig};
use agent_gateway::runner::{AgentSession, Runner, SessionStreams, StartRequest};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const STREAMED_REPLY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
    ": keepalive\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\\nwor\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"ld\"}}]}\n\n",
    "data: [DONE]\n\n",
);

type Requests = Arc<Mutex<Vec<Value>>>;

async fn chat(State(requests): State<Requests>, Json(body): Json<Value>) -> impl IntoResponse {
    requests.lock().expect("requests").push(body);
    ([(header::CONTENT_TYPE, "text/event-stream")], STREAMED_REPLY)
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded")
}

struct Stub {
    base: String,
    requests: Requests,
    cancel: CancellationToken,
}

async fn stub() -> Stub {
    let requests: Requests = Arc::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/broken", post(broken))
        .with_state(Arc::clone(&requests));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let cancel = CancellationToken::new();
    let ct = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { ct.cancelled().await })
            .await
            .expect("stub server");
    });
    Stub {
        base: format!("http://{addr}"),
        requests,
        cancel,
    }
}

async fn open(endpoint: String, system_prompt: Option<&str>) -> (AgentSession, SessionStreams) {
    let runner = HttpRunner::new(
        "llm",
        HttpRunnerConfig {
            endpoint,
            model: "test-model".into(),
            api_key_env: None,
            system_prompt: system_prompt.map(str::to_owned),
        },
    )
    .expect("runner");
    let mut session = runner
        .start(StartRequest {
            session_id: "chat-1".into(),
            ..StartRequest::default()
        })
        .await
        .expect("start")
        .expect("available");
    let streams = session.take_streams().expect("streams");
    (session, streams)
}

async fn recv(rx: &mut tokio::sync::mpsc::Receiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("line in time")
        .expect("channel open")
}

#[tokio::test]
async fn streamed_deltas_are_split_into_lines() {
    let stub = stub().await;
    let (session, mut streams) = open(
        format!("{}/v1/chat/completions", stub.base),
        Some("be brief"),
    )
    .await;

    session.send_input("greet me").await.expect("send");
    assert_eq!(recv(&mut streams.stdout).await, "hello");
    assert_eq!(recv(&mut streams.stdout).await, "world");

    let first = stub.requests.lock().expect("requests")[0].clone();
    assert_eq!(first["model"], "test-model");
    assert_eq!(first["stream"], true);
    assert_eq!(first["messages"][0]["role"], "system");
    assert_eq!(first["messages"][1]["content"], "greet me");

    session.stop().await.expect("exit");
    stub.cancel.cancel();
}

#[tokio::test]
async fn conversation_history_carries_across_turns() {
    let stub = stub().await;
    let (session, mut streams) = open(format!("{}/v1/chat/completions", stub.base), None).await;

    session.send_input("one").await.expect("send");
    recv(&mut streams.stdout).await;
    recv(&mut streams.stdout).await;
    session.send_input("two").await.expect("send");
    recv(&mut streams.stdout).await;
    recv(&mut streams.stdout).await;

    let second = stub.requests.lock().expect("requests")[1].clone();
    let messages = second["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "one");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "hello\nworld");
    assert_eq!(messages[2]["content"], "two");

    let exit = session.stop().await.expect("exit");
    assert!(exit.requested);
    stub.cancel.cancel();
}

#[tokio::test]
async fn error_status_is_reported_on_stderr() {
    let stub = stub().await;
    let (session, mut streams) = open(format!("{}/broken", stub.base), None).await;

    session.send_input("hi").await.expect("send");
    let line = recv(&mut streams.stderr).await;
    assert!(line.starts_with("http runner status 500"), "{line}");
    assert!(line.contains("model overloaded"), "{line}");
    assert!(!session.has_exited());

    session.stop().await.expect("exit");
    stub.cancel.cancel();
}
