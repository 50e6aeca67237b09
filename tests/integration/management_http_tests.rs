//! Management HTTP routes served on an ephemeral loopback port.

use std::net::SocketAddr;
use std::sync::Arc;

use agent_gateway::capacity::{SessionCapacityManager, SessionHandle};
use agent_gateway::config::{CapacityConfig, GuardLimits};
use agent_gateway::eventlog::StructuredEventLog;
use agent_gateway::gateway::AuthPolicy;
use agent_gateway::guard::ConnectionGuard;
use agent_gateway::management::http::{serve_http_on, HttpState};
use agent_gateway::management::ManagementService;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    base: String,
    capacity: Arc<SessionCapacityManager>,
    guard: Arc<ConnectionGuard>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(auth: AuthPolicy) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = Arc::new(ConnectionGuard::new(GuardLimits::default()));
        let capacity = Arc::new(SessionCapacityManager::new(&CapacityConfig::default()));
        let events =
            Arc::new(StructuredEventLog::open(dir.path().join("events.jsonl")).expect("log"));
        let service = Arc::new(ManagementService::new(
            Arc::clone(&guard),
            Arc::clone(&capacity),
            events,
            "process",
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let state = HttpState {
            service,
            auth: Arc::new(auth),
        };
        let ct = cancel.clone();
        let server = tokio::spawn(async move {
            serve_http_on(state, listener, ct).await.expect("serve");
        });

        Self {
            base: format!("http://{addr}"),
            capacity,
            guard,
            cancel,
            server,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.server.await.expect("server task");
    }
}

#[tokio::test]
async fn health_is_open_without_key() {
    let h = Harness::start(AuthPolicy::new(Some("k"), false)).await;
    let resp = reqwest::get(h.url("/health")).await.expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");
    h.shutdown().await;
}

#[tokio::test]
async fn api_requires_key_when_loopback_bypass_disabled() {
    let h = Harness::start(AuthPolicy::new(Some("k"), false)).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(h.url("/api/capacity"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"].as_str().expect("error").contains("API key"));

    let resp = client
        .get(h.url("/api/capacity"))
        .bearer_auth("k")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(h.url("/api/capacity"))
        .header("x-api-key", "k")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(h.url("/api/capacity"))
        .bearer_auth("wrong")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
    h.shutdown().await;
}

#[tokio::test]
async fn capacity_and_sessions_reflect_registrations() {
    let h = Harness::start(AuthPolicy::new(None, true)).await;
    h.capacity
        .try_register_session(
            "process",
            "s1",
            SessionHandle::new("127.0.0.1", CancellationToken::new()),
        )
        .expect("register");

    let capacity: Value = reqwest::get(h.url("/api/capacity"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(capacity["active_session_count"], 1);
    assert_eq!(capacity["can_create_session"], true);

    let sessions: Value = reqwest::get(h.url("/api/sessions"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(sessions[0]["session_id"], "s1");
    h.shutdown().await;
}

#[tokio::test]
async fn terminate_cancels_live_session_and_404s_unknown() {
    let h = Harness::start(AuthPolicy::new(None, true)).await;
    let token = CancellationToken::new();
    h.capacity
        .try_register_session("process", "live", SessionHandle::new("127.0.0.1", token.clone()))
        .expect("register");
    let client = reqwest::Client::new();

    let resp = client
        .post(h.url("/api/sessions/live/terminate"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert!(token.is_cancelled());

    let resp = client
        .post(h.url("/api/sessions/ghost/terminate"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
    h.shutdown().await;
}

#[tokio::test]
async fn ban_and_unban_round_trip() {
    let h = Harness::start(AuthPolicy::new(None, true)).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(h.url("/api/peers/10.9.8.7/ban"))
        .json(&serde_json::json!({ "reason": "scraping" }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["changed"], true);
    assert!(h.guard.is_banned("10.9.8.7"));

    let banned: Value = reqwest::get(h.url("/api/peers/banned"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(banned[0]["peer"], "10.9.8.7");
    assert_eq!(banned[0]["ban"]["reason"], "scraping");
    assert_eq!(banned[0]["ban"]["actor"], "http");

    let body: Value = client
        .post(h.url("/api/peers/10.9.8.7/unban"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["changed"], true);
    assert!(!h.guard.is_banned("10.9.8.7"));

    let history: Value = reqwest::get(h.url("/api/history?limit=10"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(history.as_array().expect("array").len(), 2);
    h.shutdown().await;
}

#[tokio::test]
async fn events_route_pages_the_log() {
    let h = Harness::start(AuthPolicy::new(None, true)).await;
    let client = reqwest::Client::new();
    client
        .post(h.url("/api/peers/10.1.1.1/ban"))
        .send()
        .await
        .expect("request");
    client
        .post(h.url("/api/peers/10.1.1.1/unban"))
        .send()
        .await
        .expect("request");

    let all: Value = reqwest::get(h.url("/api/events"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(all.as_array().expect("array").len(), 2);
    assert_eq!(all[0]["event_type"], "peer_banned");

    let tail: Value = reqwest::get(h.url("/api/events?from=1"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(tail.as_array().expect("array").len(), 1);
    assert_eq!(tail[0]["event_id"], 2);
    h.shutdown().await;
}
