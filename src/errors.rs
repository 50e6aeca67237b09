//! Error types shared across the gateway.

use std::fmt::{Display, Formatter};

/// Shared gateway result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Gateway error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Connection or session admission was refused (rate limit, ban, capacity).
    Admission(String),
    /// The selected runner cannot start a session (no command, platform mismatch).
    RunnerUnavailable(String),
    /// The operating system failed to start the agent process.
    Spawn(String),
    /// Read or write fault on a client stream or agent stdio pipe.
    Stream(String),
    /// Client sent a frame the protocol does not accept in the current state.
    Protocol(String),
    /// Structured event log failure.
    EventLog(String),
    /// IPC communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller failed API key or token validation.
    Unauthorized(String),
    /// File system path failed validation against its root directory.
    PathViolation(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Admission(msg) => write!(f, "admission denied: {msg}"),
            Self::RunnerUnavailable(msg) => write!(f, "runner unavailable: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::EventLog(msg) => write!(f, "event log: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}
