//! Bounded connection-history ring buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What happened to a peer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// Connection admitted.
    ConnectionOpen,
    /// Connection closed.
    ConnectionClose,
    /// In-session message admitted by the limiter.
    ClientMessage,
    /// Peer banned.
    Ban,
    /// Peer unbanned.
    Unban,
    /// Connection refused.
    ConnectionDenied,
    /// In-session message dropped by the limiter.
    MessageDenied,
}

/// One row of the connection history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionHistoryEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Normalized peer address.
    pub peer: String,
    /// Action taken.
    pub action: HistoryAction,
    /// Whether the action was permitted.
    pub allowed: bool,
    /// Component that asked (e.g. `stream`, `management`).
    pub component: Option<String>,
    /// Free-form detail such as a deny reason or ban actor.
    pub detail: Option<String>,
}

/// Append-only ring buffer; the oldest entries fall off once full.
#[derive(Debug)]
pub(crate) struct HistoryRing {
    entries: VecDeque<ConnectionHistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, entry: ConnectionHistoryEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// The most recent `limit` entries, oldest first. `0` returns everything.
    pub(crate) fn recent(&self, limit: usize) -> Vec<ConnectionHistoryEntry> {
        let skip = if limit == 0 {
            0
        } else {
            self.entries.len().saturating_sub(limit)
        };
        self.entries.iter().skip(skip).cloned().collect()
    }
}
