//! Wire frames exchanged on the streaming socket.
//!
//! Each frame is one JSON object on its own line. Payloads are tagged unions
//! keyed by `type`, so exactly one variant is present per frame.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::models::session::ConnectionMode;

/// Size of one `file_transfer` chunk before base64 encoding.
pub const FILE_CHUNK_BYTES: usize = 64 * 1024;

/// Frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    /// Opaque id echoed on frames and log events caused by this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Per-request context tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Message body.
    pub payload: ClientPayload,
}

impl ClientFrame {
    /// Frame with no correlation id or context.
    #[must_use]
    pub fn new(payload: ClientPayload) -> Self {
        Self {
            correlation_id: None,
            context: None,
            payload,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach a context tag.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Client message variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPayload {
    /// Present the shared API key.
    Auth {
        /// Shared key.
        api_key: String,
    },
    /// Start an agent session.
    Start {
        /// Resume or choose a session id; generated when absent.
        #[serde(default)]
        session_id: Option<String>,
        /// Agent (runner) id; the configured runner when absent.
        #[serde(default)]
        agent_id: Option<String>,
        /// Client-declared mode.
        #[serde(default)]
        mode: Option<ConnectionMode>,
    },
    /// Stop the running session.
    Stop,
    /// Plain text for the agent.
    Text {
        /// Text body.
        text: String,
    },
    /// Ask the agent to run a script.
    ScriptRequest {
        /// Script path or command.
        path: String,
        /// Interpreter hint (`bash`, `python`, ...).
        script_type: String,
    },
    /// Upload a file for the agent.
    MediaUpload {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type.
        content_type: String,
        /// Client-side file name.
        file_name: String,
    },
}

/// Delivery hint for clients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Regular output.
    #[default]
    Normal,
    /// Errors and denials.
    High,
    /// Lifecycle notifications.
    Notify,
}

/// Lifecycle event kinds carried by `event` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Connection admitted (and authenticated); Start may follow.
    Ready,
    /// Connection refused; the stream closes next.
    Denied,
    /// Agent session running.
    SessionStarted,
    /// Session ended cleanly.
    SessionStopped,
    /// Session failed or a request was invalid for the session state.
    SessionError,
    /// A client message was dropped by the rate limiter.
    RateLimited,
}

/// Frame sent by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerFrame {
    /// Correlation id of the latest client message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Delivery hint.
    #[serde(default)]
    pub priority: Priority,
    /// Message body.
    pub payload: ServerPayload,
}

/// Gateway message variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPayload {
    /// One agent stdout line.
    Output {
        /// Line text.
        text: String,
    },
    /// One agent stderr line or a gateway-side fault.
    Error {
        /// Line text.
        text: String,
    },
    /// Lifecycle notification.
    Event {
        /// Event kind.
        kind: EventKind,
        /// Human-readable detail.
        message: String,
        /// Session the event concerns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Inline media produced by the agent.
    Media {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type.
        content_type: String,
    },
    /// One chunk of a file produced by the agent.
    FileTransfer {
        /// Path relative to the agent's working directory.
        relative_path: String,
        /// Base64-encoded chunk.
        data: String,
        /// Byte offset of this chunk.
        offset: u64,
        /// Size of the whole file.
        total_size: u64,
    },
}

impl ServerPayload {
    /// Default priority for this payload.
    #[must_use]
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Output { .. } | Self::Media { .. } | Self::FileTransfer { .. } => {
                Priority::Normal
            }
            Self::Error { .. } => Priority::High,
            Self::Event { kind, .. } => match kind {
                EventKind::Denied | EventKind::SessionError => Priority::High,
                _ => Priority::Notify,
            },
        }
    }
}

/// Split a file into `file_transfer` payloads of at most [`FILE_CHUNK_BYTES`].
///
/// An empty file still produces one (empty) chunk so the client learns of it.
#[must_use]
pub fn file_transfer_chunks(relative_path: &str, data: &[u8]) -> Vec<ServerPayload> {
    let total_size = data.len() as u64;
    if data.is_empty() {
        return vec![ServerPayload::FileTransfer {
            relative_path: relative_path.to_owned(),
            data: String::new(),
            offset: 0,
            total_size,
        }];
    }
    data.chunks(FILE_CHUNK_BYTES)
        .enumerate()
        .map(|(i, chunk)| ServerPayload::FileTransfer {
            relative_path: relative_path.to_owned(),
            data: base64::engine::general_purpose::STANDARD.encode(chunk),
            offset: (i * FILE_CHUNK_BYTES) as u64,
            total_size,
        })
        .collect()
}
