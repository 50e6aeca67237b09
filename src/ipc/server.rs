//! Local IPC server for `agent-gateway-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to [`ManagementService`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "status", "auth_token": "..."}
//! {"command": "terminate", "id": "session-1", "auth_token": "..."}
//! {"command": "ban", "peer": "10.0.0.7", "reason": "abuse", "auth_token": "..."}
//! {"command": "events", "from": 120, "limit": 50, "auth_token": "..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found"}
//! ```

use std::path::Path;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::management::ManagementService;
use crate::{AppError, Result};

/// Actor recorded for operations issued through the ctl CLI.
const IPC_ACTOR: &str = "ctl";

/// Inbound IPC request from `agent-gateway-ctl`.
#[derive(Debug, Deserialize)]
pub(crate) struct IpcRequest {
    /// Command verb.
    pub(crate) command: String,
    /// Session identifier (for `terminate`).
    #[serde(default)]
    pub(crate) id: Option<String>,
    /// Peer address (for `ban`, `unban`).
    #[serde(default)]
    pub(crate) peer: Option<String>,
    /// Ban reason.
    #[serde(default)]
    pub(crate) reason: Option<String>,
    /// Agent id (for `status`).
    #[serde(default)]
    pub(crate) agent_id: Option<String>,
    /// Result limit (for `history`, `events`).
    #[serde(default)]
    pub(crate) limit: Option<i64>,
    /// Event offset (for `events`).
    #[serde(default)]
    pub(crate) from: Option<i64>,
    /// Shared-secret authentication token.
    #[serde(default)]
    pub(crate) auth_token: Option<String>,
}

/// Outbound IPC response to `agent-gateway-ctl`.
#[derive(Debug, Serialize)]
pub(crate) struct IpcResponse {
    /// Whether the command succeeded.
    pub(crate) ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_serializable<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(format!("serialization failed: {err}")),
        }
    }
}

/// State shared by IPC connections.
pub struct IpcState {
    /// Management operations.
    pub service: Arc<ManagementService>,
    /// Token every request must carry, when set.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<IpcState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state),
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Generate a fresh per-instance token and write it to `path` so
/// `agent-gateway-ctl` can pick it up. On unix the file is owner-only.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the directory or file cannot be written.
pub fn write_token_file(path: &Path) -> Result<String> {
    let token = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Ipc(format!("failed to create token dir: {err}")))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|err| AppError::Ipc(format!("failed to open token file: {err}")))?;
    std::io::Write::write_all(&mut file, token.as_bytes())
        .map_err(|err| AppError::Ipc(format!("failed to write token file: {err}")))?;

    info!(path = %path.display(), "ctl auth token written");
    Ok(token)
}

/// Route an IPC command to the management service.
pub(crate) fn dispatch_command(request: &IpcRequest, state: &IpcState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    let _guard = span.enter();

    if let Some(ref expected) = state.auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }
    }

    let service = &state.service;
    let limit = request.limit.and_then(|l| usize::try_from(l).ok());

    match request.command.as_str() {
        "status" => IpcResponse::from_serializable(&service.capacity_status(request.agent_id.as_deref())),
        "sessions" => IpcResponse::from_serializable(&service.list_sessions()),
        "abandoned" => IpcResponse::from_serializable(&service.list_abandoned()),
        "terminate" => {
            let Some(ref id) = request.id else {
                return IpcResponse::error("missing required 'id' field");
            };
            match service.terminate_session(id, IPC_ACTOR) {
                Ok(()) => IpcResponse::success(json!({ "session_id": id, "terminating": true })),
                Err(err) => IpcResponse::error(err.to_string()),
            }
        }
        "peers" => IpcResponse::from_serializable(&service.connected_peers()),
        "banned" => IpcResponse::from_serializable(&service.banned_peers()),
        "ban" => {
            let Some(ref peer) = request.peer else {
                return IpcResponse::error("missing required 'peer' field");
            };
            let reason = request.reason.as_deref().unwrap_or("banned by operator");
            let changed = service.ban_peer(peer, reason, IPC_ACTOR);
            IpcResponse::success(json!({ "peer": peer, "changed": changed }))
        }
        "unban" => {
            let Some(ref peer) = request.peer else {
                return IpcResponse::error("missing required 'peer' field");
            };
            let changed = service.unban_peer(peer, IPC_ACTOR);
            IpcResponse::success(json!({ "peer": peer, "changed": changed }))
        }
        "history" => IpcResponse::from_serializable(&service.connection_history(limit)),
        "events" => match service.events(request.from.unwrap_or(0), request.limit) {
            Ok(entries) => IpcResponse::from_serializable(&entries),
            Err(err) => IpcResponse::error(err.to_string()),
        },
        other => IpcResponse::error(format!("unknown command: {other}")),
    }
}
