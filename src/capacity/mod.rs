//! Server-wide and per-agent session admission.
//!
//! [`SessionCapacityManager`] owns the counters that bound how many agent
//! sessions may run at once. Registration stores a [`SessionHandle`] whose
//! cancellation token lets management tooling terminate a session owned by
//! some other connection task.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CapacityConfig;

/// Default retention for abandoned-session records.
pub const ABANDONED_RETENTION_HOURS: i64 = 24;

/// Handle the gateway registers for each running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Peer that owns the session's stream.
    pub peer: String,
    /// Signals the owning gateway task to stop the session.
    pub cancel: CancellationToken,
}

impl SessionHandle {
    /// Create a handle for a session owned by `peer`.
    #[must_use]
    pub fn new(peer: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            peer: peer.into(),
            cancel,
        }
    }
}

/// Read-only view of a registered session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OpenSession {
    /// Session identifier.
    pub session_id: String,
    /// Agent the session runs.
    pub agent_id: String,
    /// Owning peer.
    pub peer: String,
    /// Registration time.
    pub started_at: DateTime<Utc>,
}

/// A session whose stream disappeared without a clean stop.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AbandonedSession {
    /// Session identifier.
    pub session_id: String,
    /// Agent the session ran.
    pub agent_id: String,
    /// Why it was abandoned.
    pub reason: String,
    /// When it was marked.
    pub abandoned_at: DateTime<Utc>,
}

/// Result of a capacity query for one agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CapacitySnapshot {
    /// Whether a new session for the agent would be admitted right now.
    pub can_create_session: bool,
    /// Deny reason when `can_create_session` is false.
    pub reason: Option<String>,
    /// Server-wide cap.
    pub max_concurrent_sessions: u32,
    /// Sessions registered across all agents.
    pub active_session_count: u32,
    /// Free server-wide slots.
    pub remaining_server_capacity: u32,
    /// Agent cap, if one is configured.
    pub agent_max_concurrent_sessions: Option<u32>,
    /// Sessions registered for this agent.
    pub agent_active_session_count: u32,
    /// Free agent slots, if the agent is capped.
    pub remaining_agent_capacity: Option<u32>,
}

struct Registered {
    agent_id: String,
    handle: SessionHandle,
    started_at: DateTime<Utc>,
}

struct CapacityState {
    server_cap: u32,
    agent_caps: HashMap<String, u32>,
    sessions: HashMap<String, Registered>,
    agent_counts: HashMap<String, u32>,
    abandoned: HashMap<String, AbandonedSession>,
}

impl CapacityState {
    fn active(&self) -> u32 {
        u32::try_from(self.sessions.len()).unwrap_or(u32::MAX)
    }

    fn agent_active(&self, agent_id: &str) -> u32 {
        self.agent_counts.get(agent_id).copied().unwrap_or(0)
    }

    /// Deny reason for a new session of `agent_id`, server cap first.
    fn admission_error(&self, agent_id: &str) -> Option<String> {
        if self.active() >= self.server_cap {
            return Some(format!(
                "Server session limit reached ({})",
                self.server_cap
            ));
        }
        if let Some(cap) = self.agent_caps.get(agent_id) {
            if self.agent_active(agent_id) >= *cap {
                return Some(format!("Agent '{agent_id}' session limit reached ({cap})"));
            }
        }
        None
    }
}

/// Shared session-capacity service.
pub struct SessionCapacityManager {
    state: Mutex<CapacityState>,
}

impl SessionCapacityManager {
    /// Build a manager from the `[capacity]` section.
    #[must_use]
    pub fn new(config: &CapacityConfig) -> Self {
        Self {
            state: Mutex::new(CapacityState {
                server_cap: config.max_concurrent_sessions,
                agent_caps: config.agents.clone(),
                sessions: HashMap::new(),
                agent_counts: HashMap::new(),
                abandoned: HashMap::new(),
            }),
        }
    }

    /// Admit a session and store its handle.
    ///
    /// Clears any abandoned record carrying the same session id.
    ///
    /// # Errors
    ///
    /// Returns the human-readable deny reason when the server cap, the
    /// agent cap, or session-id uniqueness would be violated.
    pub fn try_register_session(
        &self,
        agent_id: &str,
        session_id: &str,
        handle: SessionHandle,
    ) -> std::result::Result<(), String> {
        let mut state = self.lock();
        if state.sessions.contains_key(session_id) {
            return Err(format!("Session '{session_id}' is already active"));
        }
        if let Some(reason) = state.admission_error(agent_id) {
            debug!(agent_id, session_id, reason, "session admission denied");
            return Err(reason);
        }

        state.sessions.insert(
            session_id.to_owned(),
            Registered {
                agent_id: agent_id.to_owned(),
                handle,
                started_at: Utc::now(),
            },
        );
        *state.agent_counts.entry(agent_id.to_owned()).or_insert(0) += 1;
        if state.abandoned.remove(session_id).is_some() {
            info!(session_id, "abandoned session resumed");
        }
        debug!(
            agent_id,
            session_id,
            active = state.active(),
            "session registered"
        );
        Ok(())
    }

    /// Release the slot held by `session_id`; no-op if it is not registered.
    pub fn unregister_session(&self, agent_id: &str, session_id: &str) {
        let mut state = self.lock();
        let Some(registered) = state.sessions.remove(session_id) else {
            return;
        };
        if registered.agent_id != agent_id {
            debug!(
                session_id,
                expected = agent_id,
                actual = registered.agent_id,
                "unregister agent mismatch, using registered agent"
            );
        }
        let agent = registered.agent_id;
        if let Some(count) = state.agent_counts.get_mut(&agent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.agent_counts.remove(&agent);
            }
        }
        debug!(session_id, agent, active = state.active(), "session unregistered");
    }

    /// Record that `session_id` lost its client without a clean stop.
    pub fn mark_session_abandoned(&self, session_id: &str, agent_id: &str, reason: &str) {
        let record = AbandonedSession {
            session_id: session_id.to_owned(),
            agent_id: agent_id.to_owned(),
            reason: reason.to_owned(),
            abandoned_at: Utc::now(),
        };
        self.lock().abandoned.insert(session_id.to_owned(), record);
        info!(session_id, agent_id, reason, "session marked abandoned");
    }

    /// Admission outlook for `agent_id` without registering anything.
    #[must_use]
    pub fn status(&self, agent_id: &str) -> CapacitySnapshot {
        let state = self.lock();
        let reason = state.admission_error(agent_id);
        let active = state.active();
        let agent_active = state.agent_active(agent_id);
        let agent_cap = state.agent_caps.get(agent_id).copied();
        CapacitySnapshot {
            can_create_session: reason.is_none(),
            reason,
            max_concurrent_sessions: state.server_cap,
            active_session_count: active,
            remaining_server_capacity: state.server_cap.saturating_sub(active),
            agent_max_concurrent_sessions: agent_cap,
            agent_active_session_count: agent_active,
            remaining_agent_capacity: agent_cap.map(|cap| cap.saturating_sub(agent_active)),
        }
    }

    /// Registered sessions, oldest first.
    #[must_use]
    pub fn list_open_sessions(&self) -> Vec<OpenSession> {
        let state = self.lock();
        let mut sessions: Vec<OpenSession> = state
            .sessions
            .iter()
            .map(|(id, reg)| OpenSession {
                session_id: id.clone(),
                agent_id: reg.agent_id.clone(),
                peer: reg.handle.peer.clone(),
                started_at: reg.started_at,
            })
            .collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Abandoned records, most recent first.
    #[must_use]
    pub fn list_abandoned_sessions(&self) -> Vec<AbandonedSession> {
        let mut records: Vec<AbandonedSession> = self.lock().abandoned.values().cloned().collect();
        records.sort_by(|a, b| b.abandoned_at.cmp(&a.abandoned_at));
        records
    }

    /// Ask the gateway task owning `session_id` to stop it.
    ///
    /// Returns `false` if no such session is registered. The slot is freed
    /// by the owning task once it has torn the session down.
    pub fn try_terminate_session(&self, session_id: &str) -> bool {
        let state = self.lock();
        let Some(registered) = state.sessions.get(session_id) else {
            return false;
        };
        registered.handle.cancel.cancel();
        info!(session_id, "session termination requested");
        true
    }

    /// Replace the caps. Running sessions are never evicted.
    pub fn update_caps(&self, config: &CapacityConfig) {
        let mut state = self.lock();
        state.server_cap = config.max_concurrent_sessions;
        state.agent_caps.clone_from(&config.agents);
        info!(
            server_cap = state.server_cap,
            agents = state.agent_caps.len(),
            "session caps updated"
        );
    }

    /// Drop abandoned records older than `retention`; returns how many.
    pub fn prune_abandoned(&self, retention: ChronoDuration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut state = self.lock();
        let before = state.abandoned.len();
        state.abandoned.retain(|_, rec| rec.abandoned_at > cutoff);
        before - state.abandoned.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CapacityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
