//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a gateway session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Stream admitted, no agent yet.
    Idle,
    /// Capacity and runner checks in progress.
    Starting,
    /// Agent running and pumps active.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Terminal state.
    Terminated,
}

/// How the client intends to drive the agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Conversational back-and-forth.
    #[default]
    Interactive,
    /// Fire-and-forget scripted input.
    Batch,
}

/// State of one session owned by a gateway connection task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Session {
    /// Client-supplied or generated identifier.
    pub id: String,
    /// Agent (runner) id the session runs against.
    pub agent_id: String,
    /// Client-declared mode.
    pub mode: ConnectionMode,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Context tag prepended to text sent to the agent.
    pub context: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// New idle session; a missing or blank id is replaced with a UUID v4.
    #[must_use]
    pub fn new(id: Option<String>, agent_id: impl Into<String>, mode: ConnectionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            agent_id: agent_id.into(),
            mode,
            status: SessionStatus::Idle,
            context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (SessionStatus::Idle, SessionStatus::Starting)
                | (
                    SessionStatus::Starting,
                    SessionStatus::Running | SessionStatus::Stopping
                )
                | (SessionStatus::Running, SessionStatus::Stopping)
                | (SessionStatus::Stopping, SessionStatus::Terminated)
        )
    }

    /// Apply a transition; returns `false` (and leaves the status alone)
    /// when the transition is not permitted.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}
