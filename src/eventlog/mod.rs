//! Structured event log for gateway lifecycle and security events.
//!
//! [`StructuredEventLog`] appends one JSON object per line to a single file
//! and assigns every entry a strictly increasing `event_id` that survives
//! restarts. Readers take bounded snapshots or tail the file live.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity attached to a log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal lifecycle event.
    Info,
    /// Recoverable anomaly (rate limit, denied admission).
    Warning,
    /// Failure affecting a session.
    Error,
}

/// Event type classification written to the `event_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Gateway listeners are up.
    GatewayStarted,
    /// Gateway is shutting down.
    GatewayStopped,
    /// A peer connection was admitted.
    ConnectionOpened,
    /// A peer connection was refused.
    ConnectionDenied,
    /// A peer connection closed.
    ConnectionClosed,
    /// A session reached `Running`.
    SessionStarted,
    /// A session ended cleanly.
    SessionStopped,
    /// A session failed to start or ended unexpectedly.
    SessionError,
    /// A session's peer vanished without a clean stop.
    SessionAbandoned,
    /// A client message was dropped by the message limiter.
    MessageRateLimited,
    /// Transient read or write fault on a stream.
    StreamError,
    /// A peer was banned.
    PeerBanned,
    /// A peer was unbanned.
    PeerUnbanned,
}

impl EventType {
    /// Wire name stored in the log file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GatewayStarted => "gateway_started",
            Self::GatewayStopped => "gateway_stopped",
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionDenied => "connection_denied",
            Self::ConnectionClosed => "connection_closed",
            Self::SessionStarted => "session_started",
            Self::SessionStopped => "session_stopped",
            Self::SessionError => "session_error",
            Self::SessionAbandoned => "session_abandoned",
            Self::MessageRateLimited => "message_rate_limited",
            Self::StreamError => "stream_error",
            Self::PeerBanned => "peer_banned",
            Self::PeerUnbanned => "peer_unbanned",
        }
    }
}

/// One persisted line of the structured event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonically increasing identifier.
    pub event_id: i64,
    /// UTC timestamp of the write.
    pub timestamp_utc: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Event classification (see [`EventType::as_str`]).
    pub event_type: String,
    /// Human-readable message.
    pub message: String,
    /// Emitting component (`gateway`, `guard`, `management`, ...).
    pub component: String,
    /// Associated session, if any.
    pub session_id: Option<String>,
    /// Correlation id of the client request that caused the event.
    pub correlation_id: Option<String>,
    /// Raw JSON string with event-specific details.
    pub details_json: Option<String>,
}

/// An entry about to be written; the writer assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Event classification.
    pub event_type: EventType,
    /// Human-readable message.
    pub message: String,
    /// Emitting component.
    pub component: String,
    /// Associated session, if any.
    pub session_id: Option<String>,
    /// Correlation id, if any.
    pub correlation_id: Option<String>,
    /// Serialized details blob.
    pub details_json: Option<String>,
}

impl LogRecord {
    /// Construct a record with no optional fields set.
    #[must_use]
    pub fn new(
        level: LogLevel,
        event_type: EventType,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            level,
            event_type,
            message: message.into(),
            component: component.into(),
            session_id: None,
            correlation_id: None,
            details_json: None,
        }
    }

    /// Set the session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the correlation identifier when one is known.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_owned);
        self
    }

    /// Attach a JSON details blob.
    #[must_use]
    pub fn with_details(mut self, details: &serde_json::Value) -> Self {
        self.details_json = Some(details.to_string());
        self
    }
}

pub use writer::StructuredEventLog;
