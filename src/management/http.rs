//! Management HTTP surface.
//!
//! JSON routes over [`ManagementService`]. Every route except `/health` is
//! guarded by the same API key / loopback policy as the streaming socket;
//! the key is accepted as `Authorization: Bearer <key>` or `X-Api-Key`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ManagementService;
use crate::gateway::AuthPolicy;
use crate::{AppError, Result};

/// Actor recorded for operations issued over HTTP.
const HTTP_ACTOR: &str = "http";

/// Shared state for the management routes.
#[derive(Clone)]
pub struct HttpState {
    /// Management operations.
    pub service: Arc<ManagementService>,
    /// Key policy.
    pub auth: Arc<AuthPolicy>,
}

#[derive(Debug, Deserialize)]
struct CapacityQuery {
    agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    from: i64,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct BanBody {
    reason: Option<String>,
    actor: Option<String>,
}

async fn health() -> &'static str {
    "ok"
}

async fn capacity(State(state): State<HttpState>, Query(q): Query<CapacityQuery>) -> Response {
    Json(state.service.capacity_status(q.agent_id.as_deref())).into_response()
}

async fn sessions(State(state): State<HttpState>) -> Response {
    Json(state.service.list_sessions()).into_response()
}

async fn abandoned(State(state): State<HttpState>) -> Response {
    Json(state.service.list_abandoned()).into_response()
}

async fn terminate(State(state): State<HttpState>, Path(session_id): Path<String>) -> Response {
    match state.service.terminate_session(&session_id, HTTP_ACTOR) {
        Ok(()) => Json(json!({ "session_id": session_id, "terminating": true })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn peers(State(state): State<HttpState>) -> Response {
    Json(state.service.connected_peers()).into_response()
}

async fn banned(State(state): State<HttpState>) -> Response {
    Json(state.service.banned_peers()).into_response()
}

/// Optional JSON body; an empty body means all defaults.
fn parse_ban_body(raw: &Bytes) -> Result<BanBody> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BanBody::default());
    }
    Ok(serde_json::from_slice(raw)?)
}

async fn ban(
    State(state): State<HttpState>,
    Path(peer): Path<String>,
    raw: Bytes,
) -> Response {
    let body = match parse_ban_body(&raw) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    let reason = body.reason.unwrap_or_else(|| "banned by operator".into());
    let actor = body.actor.unwrap_or_else(|| HTTP_ACTOR.into());
    let changed = state.service.ban_peer(&peer, &reason, &actor);
    Json(json!({ "peer": peer, "changed": changed })).into_response()
}

async fn unban(
    State(state): State<HttpState>,
    Path(peer): Path<String>,
    raw: Bytes,
) -> Response {
    let actor = match parse_ban_body(&raw) {
        Ok(body) => body.actor.unwrap_or_else(|| HTTP_ACTOR.into()),
        Err(err) => return error_response(&err),
    };
    let changed = state.service.unban_peer(&peer, &actor);
    Json(json!({ "peer": peer, "changed": changed })).into_response()
}

async fn history(State(state): State<HttpState>, Query(q): Query<LimitQuery>) -> Response {
    Json(state.service.connection_history(q.limit)).into_response()
}

async fn events(State(state): State<HttpState>, Query(q): Query<EventsQuery>) -> Response {
    match state.service.events(q.from, q.limit) {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        AppError::Config(_) | AppError::Protocol(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

async fn require_key(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    if state.auth.admits(&peer, presented_key(request.headers())) {
        return next.run(request).await;
    }
    warn!(peer, path = %request.uri().path(), "management request rejected");
    error_response(&AppError::Unauthorized("missing or invalid API key".into()))
}

/// Build the management router.
pub fn router(state: HttpState) -> Router {
    let api = Router::new()
        .route("/api/capacity", get(capacity))
        .route("/api/sessions", get(sessions))
        .route("/api/sessions/abandoned", get(abandoned))
        .route("/api/sessions/{session_id}/terminate", post(terminate))
        .route("/api/peers", get(peers))
        .route("/api/peers/banned", get(banned))
        .route("/api/peers/{peer}/ban", post(ban))
        .route("/api/peers/{peer}/unban", post(unban))
        .route("/api/history", get(history))
        .route("/api/events", get(events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_key))
        .with_state(state);

    Router::new().route("/health", get(health)).merge(api)
}

/// Serve the management router on `bind` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or if the server
/// fails while running.
pub async fn serve_http(state: HttpState, bind: SocketAddr, ct: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind management HTTP on {bind}: {err}")))?;
    serve_http_on(state, listener, ct).await
}

/// Serve the management router on an already-bound listener.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails while running.
pub async fn serve_http_on(
    state: HttpState,
    listener: tokio::net::TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "management HTTP listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { ct.cancelled().await })
    .await
    .map_err(|err| AppError::Config(format!("management HTTP server error: {err}")))?;

    info!("management HTTP shut down");
    Ok(())
}
