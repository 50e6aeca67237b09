//! Per-peer connection admission, message rate limiting, and banning.
//!
//! [`ConnectionGuard`] is shared by every connection handler. Peer state
//! lives behind one mutex per peer so concurrent handlers for different
//! hosts never contend; the peer map itself is only write-locked to insert
//! new peers or prune idle ones.
//!
//! Escalation: every attempt beyond `max_connection_attempts_per_window`
//! counts as a violation. Once `dos_violation_threshold` violations pile up
//! the peer is blocked for `dos_block_seconds`. Blocks expire on their own;
//! bans last until [`ConnectionGuard::unban_peer`].

pub mod history;
pub mod peer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GuardLimits;
use history::HistoryRing;
use peer::{prune_window, PeerState};

pub use history::{ConnectionHistoryEntry, HistoryAction};
pub use peer::{is_loopback, normalize_peer, BanRecord};

/// Outcome of a connection admission check.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Decision {
    /// Whether the connection may proceed.
    pub allowed: bool,
    /// Normalized peer address the decision applies to.
    pub peer: String,
    /// Human-readable reason when refused.
    pub denied_reason: Option<String>,
}

impl Decision {
    fn allow(peer: String) -> Self {
        Self {
            allowed: true,
            peer,
            denied_reason: None,
        }
    }

    fn deny(peer: String, reason: String) -> Self {
        Self {
            allowed: false,
            peer,
            denied_reason: Some(reason),
        }
    }
}

/// Read-only view of a tracked peer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Normalized peer address.
    pub peer: String,
    /// Currently open connections.
    pub active_connections: u32,
    /// Attempt-window violations since the last block.
    pub violation_count: u32,
    /// Seconds left on a temporary block, if blocked.
    pub blocked_for_seconds: Option<u64>,
    /// Whether the peer is banned.
    pub banned: bool,
    /// First contact.
    pub first_seen: DateTime<Utc>,
    /// Most recent contact.
    pub last_seen: DateTime<Utc>,
}

/// A banned peer and its ban record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BannedPeer {
    /// Normalized peer address.
    pub peer: String,
    /// Ban details, nested under `ban` on the wire.
    pub ban: BanRecord,
}

type PeerMap = HashMap<String, Arc<Mutex<PeerState>>>;

/// Shared admission-control service for remote peers.
pub struct ConnectionGuard {
    limits: RwLock<GuardLimits>,
    peers: RwLock<PeerMap>,
    history: Mutex<HistoryRing>,
}

impl ConnectionGuard {
    /// Create a guard with the given limits and empty state.
    #[must_use]
    pub fn new(limits: GuardLimits) -> Self {
        Self {
            history: Mutex::new(HistoryRing::new(limits.history_capacity)),
            limits: RwLock::new(limits),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Current limits.
    #[must_use]
    pub fn limits(&self) -> GuardLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the limits; existing peer state is kept.
    pub fn update_limits(&self, limits: GuardLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_capacity(limits.history_capacity);
        info!(?limits, "connection guard limits updated");
    }

    /// Decide whether `peer_addr` may open a new connection.
    ///
    /// On success the peer's active-connection count is incremented; the
    /// caller must pair it with [`Self::close_connection`].
    pub fn try_open_connection(&self, peer_addr: &str, component: &str) -> Decision {
        let limits = self.limits();
        let peer = normalize_peer(peer_addr);
        let now = Instant::now();
        let state = self.peer_entry(&peer);
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        st.last_seen = Utc::now();

        if st.ban.is_some() {
            return self.denied(peer, component, "peer is banned".to_owned());
        }

        if let Some(remaining) = st.block_remaining(now) {
            return self.denied(
                peer,
                component,
                format!(
                    "peer is temporarily blocked for another {}s",
                    remaining.as_secs().max(1)
                ),
            );
        }

        if st.active_connections >= limits.max_concurrent_connections_per_peer {
            let reason = format!(
                "peer already has {} active connections (limit {})",
                st.active_connections, limits.max_concurrent_connections_per_peer
            );
            return self.denied(peer, component, reason);
        }

        let window = Duration::from_secs(limits.connection_attempt_window_seconds);
        prune_window(&mut st.attempts, now, window);
        if st.attempts.len() >= limits.max_connection_attempts_per_window as usize {
            st.violations += 1;
            let mut reason = format!(
                "connection attempts exceeded {} per {}s window",
                limits.max_connection_attempts_per_window, limits.connection_attempt_window_seconds
            );
            if st.violations >= limits.dos_violation_threshold {
                st.blocked_until = Some(now + Duration::from_secs(limits.dos_block_seconds));
                st.violations = 0;
                st.attempts.clear();
                reason.push_str(&format!(
                    "; peer temporarily blocked for {}s",
                    limits.dos_block_seconds
                ));
                warn!(peer, block_seconds = limits.dos_block_seconds, "peer temporarily blocked");
            }
            return self.denied(peer, component, reason);
        }

        st.attempts.push_back(now);
        st.active_connections += 1;
        let active = st.active_connections;
        drop(st);

        debug!(peer, active, component, "connection admitted");
        self.record(&peer, HistoryAction::ConnectionOpen, true, component, None);
        Decision::allow(peer)
    }

    /// Release one active connection held by `peer_addr`.
    pub fn close_connection(&self, peer_addr: &str) {
        let peer = normalize_peer(peer_addr);
        let existing = self.peer_existing(&peer);
        if let Some(state) = existing {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            st.active_connections = st.active_connections.saturating_sub(1);
            st.last_seen = Utc::now();
        }
        self.record(&peer, HistoryAction::ConnectionClose, true, "stream", None);
    }

    /// Admit one in-session client message from `peer_addr`.
    ///
    /// Returns `false` when the message window is full; the caller drops the
    /// message and keeps the connection.
    pub fn try_register_client_message(&self, peer_addr: &str, component: &str) -> bool {
        let limits = self.limits();
        let peer = normalize_peer(peer_addr);
        let now = Instant::now();
        let state = self.peer_entry(&peer);
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        st.last_seen = Utc::now();

        let window = Duration::from_secs(limits.client_message_window_seconds);
        prune_window(&mut st.messages, now, window);
        if st.messages.len() >= limits.max_client_messages_per_window as usize {
            drop(st);
            let detail = format!(
                "more than {} messages per {}s window",
                limits.max_client_messages_per_window, limits.client_message_window_seconds
            );
            self.record(
                &peer,
                HistoryAction::MessageDenied,
                false,
                component,
                Some(detail),
            );
            return false;
        }

        st.messages.push_back(now);
        drop(st);
        self.record(&peer, HistoryAction::ClientMessage, true, component, None);
        true
    }

    /// Whether `peer_addr` is currently banned.
    #[must_use]
    pub fn is_banned(&self, peer_addr: &str) -> bool {
        let peer = normalize_peer(peer_addr);
        self.peer_existing(&peer).is_some_and(|state| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ban
                .is_some()
        })
    }

    /// Ban `peer_addr` until explicitly unbanned.
    ///
    /// Returns `true` if the peer was not banned before. Banning an already
    /// banned peer leaves the original record in place.
    pub fn ban_peer(&self, peer_addr: &str, reason: &str, actor: &str) -> bool {
        let peer = normalize_peer(peer_addr);
        if peer.is_empty() {
            return false;
        }
        let state = self.peer_entry(&peer);
        let changed = {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            if st.ban.is_some() {
                false
            } else {
                st.ban = Some(BanRecord {
                    reason: reason.to_owned(),
                    actor: actor.to_owned(),
                    banned_at: Utc::now(),
                });
                true
            }
        };
        if changed {
            info!(peer, reason, actor, "peer banned");
            self.record(
                &peer,
                HistoryAction::Ban,
                true,
                "management",
                Some(format!("{reason} (by {actor})")),
            );
        }
        changed
    }

    /// Lift a ban. Returns `true` if the peer was banned.
    pub fn unban_peer(&self, peer_addr: &str, actor: &str) -> bool {
        let peer = normalize_peer(peer_addr);
        let Some(state) = self.peer_existing(&peer) else {
            return false;
        };
        let changed = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ban
            .take()
            .is_some();
        if changed {
            info!(peer, actor, "peer unbanned");
            self.record(
                &peer,
                HistoryAction::Unban,
                true,
                "management",
                Some(format!("by {actor}")),
            );
        }
        changed
    }

    /// Peers with at least one open connection, sorted by address.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .all_snapshots()
            .into_iter()
            .filter(|p| p.active_connections > 0)
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    /// Every banned peer, sorted by address.
    #[must_use]
    pub fn banned_peers(&self) -> Vec<BannedPeer> {
        let entries: Vec<(String, Arc<Mutex<PeerState>>)> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut banned: Vec<BannedPeer> = entries
            .into_iter()
            .filter_map(|(peer, state)| {
                let st = state.lock().unwrap_or_else(PoisonError::into_inner);
                st.ban.clone().map(|ban| BannedPeer { peer, ban })
            })
            .collect();
        banned.sort_by(|a, b| a.peer.cmp(&b.peer));
        banned
    }

    /// Most recent `limit` history entries, oldest first (`0` = all retained).
    #[must_use]
    pub fn connection_history(&self, limit: usize) -> Vec<ConnectionHistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    /// Forget peers with no connections, ban, block, or in-window activity.
    ///
    /// Returns the number of peers removed. Peers currently being inspected
    /// by another handler are skipped.
    pub fn prune_idle(&self) -> usize {
        let limits = self.limits();
        let attempt_window = Duration::from_secs(limits.connection_attempt_window_seconds);
        let message_window = Duration::from_secs(limits.client_message_window_seconds);
        let now = Instant::now();

        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let before = peers.len();
        peers.retain(|_, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            !st.is_idle(now, attempt_window, message_window)
        });
        before - peers.len()
    }

    fn all_snapshots(&self) -> Vec<PeerSnapshot> {
        let entries: Vec<(String, Arc<Mutex<PeerState>>)> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let now = Instant::now();
        entries
            .into_iter()
            .map(|(peer, state)| {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                PeerSnapshot {
                    peer,
                    active_connections: st.active_connections,
                    violation_count: st.violations,
                    blocked_for_seconds: st.block_remaining(now).map(|d| d.as_secs().max(1)),
                    banned: st.ban.is_some(),
                    first_seen: st.first_seen,
                    last_seen: st.last_seen,
                }
            })
            .collect()
    }

    fn peer_existing(&self, peer: &str) -> Option<Arc<Mutex<PeerState>>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(Arc::clone)
    }

    fn peer_entry(&self, peer: &str) -> Arc<Mutex<PeerState>> {
        if let Some(state) = self.peer_existing(peer) {
            return state;
        }
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            peers
                .entry(peer.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(PeerState::new()))),
        )
    }

    fn denied(&self, peer: String, component: &str, reason: String) -> Decision {
        debug!(peer, component, reason, "connection denied");
        self.record(
            &peer,
            HistoryAction::ConnectionDenied,
            false,
            component,
            Some(reason.clone()),
        );
        Decision::deny(peer, reason)
    }

    fn record(
        &self,
        peer: &str,
        action: HistoryAction,
        allowed: bool,
        component: &str,
        detail: Option<String>,
    ) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ConnectionHistoryEntry {
                timestamp: Utc::now(),
                peer: peer.to_owned(),
                action,
                allowed,
                component: Some(component.to_owned()),
                detail,
            });
    }
}

/// Periodically drop idle peers until `cancel` fires.
#[must_use]
pub fn spawn_idle_sweeper(
    guard: Arc<ConnectionGuard>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("idle peer sweeper shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }
            let removed = guard.prune_idle();
            if removed > 0 {
                debug!(removed, "pruned idle peers");
            }
        }
    })
}
