//! Operator-facing management calls.
//!
//! [`ManagementService`] is the single entry point the HTTP routes and the
//! local IPC server both call into. It adds event-log entries for
//! state-changing operations; everything else is a thin read over the core
//! services.

pub mod http;

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::capacity::{AbandonedSession, CapacitySnapshot, OpenSession, SessionCapacityManager};
use crate::eventlog::{EventType, LogEntry, LogLevel, LogRecord, StructuredEventLog};
use crate::guard::{BannedPeer, ConnectionGuard, ConnectionHistoryEntry, PeerSnapshot};
use crate::{AppError, Result};

const COMPONENT: &str = "management";

/// Default number of history rows returned when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Default number of event-log entries returned when no limit is given.
pub const DEFAULT_EVENT_LIMIT: i64 = 200;

/// Management operations over the gateway's shared services.
pub struct ManagementService {
    guard: Arc<ConnectionGuard>,
    capacity: Arc<SessionCapacityManager>,
    events: Arc<StructuredEventLog>,
    default_agent: String,
}

impl ManagementService {
    /// Wire the service to the shared state. `default_agent` is the agent
    /// id reported by [`Self::capacity_status`] when none is requested.
    #[must_use]
    pub fn new(
        guard: Arc<ConnectionGuard>,
        capacity: Arc<SessionCapacityManager>,
        events: Arc<StructuredEventLog>,
        default_agent: impl Into<String>,
    ) -> Self {
        Self {
            guard,
            capacity,
            events,
            default_agent: default_agent.into(),
        }
    }

    /// Capacity outlook for `agent_id` (or the default agent).
    #[must_use]
    pub fn capacity_status(&self, agent_id: Option<&str>) -> CapacitySnapshot {
        self.capacity
            .status(agent_id.unwrap_or(&self.default_agent))
    }

    /// Sessions currently registered.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<OpenSession> {
        self.capacity.list_open_sessions()
    }

    /// Sessions abandoned by their clients.
    #[must_use]
    pub fn list_abandoned(&self) -> Vec<AbandonedSession> {
        self.capacity.list_abandoned_sessions()
    }

    /// Ask the owning connection to stop `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session is registered.
    pub fn terminate_session(&self, session_id: &str, actor: &str) -> Result<()> {
        if !self.capacity.try_terminate_session(session_id) {
            return Err(AppError::NotFound(format!(
                "session '{session_id}' is not active"
            )));
        }
        info!(session_id, actor, "session termination requested by operator");
        self.events.write(
            LogRecord::new(
                LogLevel::Info,
                EventType::SessionStopped,
                format!("termination requested by {actor}"),
                COMPONENT,
            )
            .with_session(session_id)
            .with_details(&json!({ "actor": actor })),
        );
        Ok(())
    }

    /// Peers with open connections.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerSnapshot> {
        self.guard.connected_peers()
    }

    /// Banned peers.
    #[must_use]
    pub fn banned_peers(&self) -> Vec<BannedPeer> {
        self.guard.banned_peers()
    }

    /// Ban `peer`; returns whether the ban is new.
    pub fn ban_peer(&self, peer: &str, reason: &str, actor: &str) -> bool {
        let changed = self.guard.ban_peer(peer, reason, actor);
        if changed {
            self.events.write(
                LogRecord::new(
                    LogLevel::Warning,
                    EventType::PeerBanned,
                    format!("peer {peer} banned: {reason}"),
                    COMPONENT,
                )
                .with_details(&json!({ "peer": peer, "reason": reason, "actor": actor })),
            );
        }
        changed
    }

    /// Lift a ban; returns whether the peer was banned.
    pub fn unban_peer(&self, peer: &str, actor: &str) -> bool {
        let changed = self.guard.unban_peer(peer, actor);
        if changed {
            self.events.write(
                LogRecord::new(
                    LogLevel::Info,
                    EventType::PeerUnbanned,
                    format!("peer {peer} unbanned"),
                    COMPONENT,
                )
                .with_details(&json!({ "peer": peer, "actor": actor })),
            );
        }
        changed
    }

    /// Most recent connection-history rows.
    #[must_use]
    pub fn connection_history(&self, limit: Option<usize>) -> Vec<ConnectionHistoryEntry> {
        self.guard
            .connection_history(limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
    }

    /// Event-log entries after `from_offset`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::EventLog` if the log file cannot be read.
    pub fn events(&self, from_offset: i64, limit: Option<i64>) -> Result<Vec<LogEntry>> {
        self.events
            .snapshot(from_offset, limit.unwrap_or(DEFAULT_EVENT_LIMIT))
    }
}
