//! Local IPC server round trips over a real namespaced socket.

use std::sync::Arc;

use agent_gateway::capacity::SessionCapacityManager;
use agent_gateway::config::{CapacityConfig, GuardLimits};
use agent_gateway::eventlog::StructuredEventLog;
use agent_gateway::guard::ConnectionGuard;
use agent_gateway::ipc::server::{spawn_ipc_server, IpcState};
use agent_gateway::management::ManagementService;
use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::GenericNamespaced;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "test-token";

struct Server {
    name: String,
    guard: Arc<ConnectionGuard>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

fn start_server() -> Server {
    let dir = tempfile::tempdir().expect("tempdir");
    let guard = Arc::new(ConnectionGuard::new(GuardLimits::default()));
    let capacity = Arc::new(SessionCapacityManager::new(&CapacityConfig::default()));
    let events = Arc::new(StructuredEventLog::open(dir.path().join("events.jsonl")).expect("log"));
    let service = Arc::new(ManagementService::new(
        Arc::clone(&guard),
        capacity,
        events,
        "process",
    ));
    let name = format!("agent-gateway-test-{}", uuid::Uuid::new_v4());
    let cancel = CancellationToken::new();
    let handle = spawn_ipc_server(
        &name,
        Arc::new(IpcState {
            service,
            auth_token: Some(TOKEN.into()),
        }),
        cancel.clone(),
    )
    .expect("ipc server");
    Server {
        name,
        guard,
        cancel,
        handle,
        _dir: dir,
    }
}

/// Send each request on one connection and collect the responses.
async fn exchange(name: &str, requests: &[Value]) -> Vec<Value> {
    let ns = name.to_ns_name::<GenericNamespaced>().expect("name");
    let stream = LocalSocketStream::connect(ns).await.expect("connect");
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    let mut responses = Vec::new();
    for request in requests {
        let mut line = request.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.expect("write");
        let reply = lines.next_line().await.expect("read").expect("reply line");
        responses.push(serde_json::from_str(&reply).expect("json"));
    }
    responses
}

#[tokio::test]
async fn ban_over_ipc_reaches_the_guard() {
    let server = start_server();

    let replies = exchange(
        &server.name,
        &[
            json!({ "command": "ban", "peer": "10.7.7.7:1234", "reason": "abuse", "auth_token": TOKEN }),
            json!({ "command": "banned", "auth_token": TOKEN }),
            json!({ "command": "unban", "peer": "10.7.7.7", "auth_token": TOKEN }),
        ],
    )
    .await;

    assert_eq!(replies[0]["ok"], true);
    assert_eq!(replies[0]["data"]["changed"], true);
    assert_eq!(replies[1]["data"][0]["peer"], "10.7.7.7");
    assert_eq!(replies[1]["data"][0]["ban"]["actor"], "ctl");
    assert_eq!(replies[2]["data"]["changed"], true);
    assert!(!server.guard.is_banned("10.7.7.7"));

    server.cancel.cancel();
    server.handle.await.expect("server task");
}

#[tokio::test]
async fn bad_token_and_bad_json_are_rejected_without_closing() {
    let server = start_server();

    let ns = server
        .name
        .as_str()
        .to_ns_name::<GenericNamespaced>()
        .expect("name");
    let stream = LocalSocketStream::connect(ns).await.expect("connect");
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"command\":\"sessions\",\"auth_token\":\"nope\"}\nnot json\n")
        .await
        .expect("write");
    let first: Value =
        serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");
    assert_eq!(first["ok"], false);
    assert_eq!(first["error"], "unauthorized");

    let second: Value =
        serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");
    assert_eq!(second["ok"], false);
    assert!(second["error"]
        .as_str()
        .expect("error")
        .starts_with("invalid json"));

    server.cancel.cancel();
    server.handle.await.expect("server task");
}
