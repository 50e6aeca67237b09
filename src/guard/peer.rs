//! Per-peer admission state and sliding-window helpers.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Active ban on a peer; cleared only by an explicit unban.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BanRecord {
    /// Operator-supplied reason.
    pub reason: String,
    /// Who issued the ban.
    pub actor: String,
    /// When the ban was applied.
    pub banned_at: DateTime<Utc>,
}

/// Mutable state for one remote address. Always accessed under its own mutex.
#[derive(Debug)]
pub(crate) struct PeerState {
    pub(crate) attempts: VecDeque<Instant>,
    pub(crate) messages: VecDeque<Instant>,
    pub(crate) violations: u32,
    pub(crate) blocked_until: Option<Instant>,
    pub(crate) ban: Option<BanRecord>,
    pub(crate) active_connections: u32,
    pub(crate) first_seen: DateTime<Utc>,
    pub(crate) last_seen: DateTime<Utc>,
}

impl PeerState {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            attempts: VecDeque::new(),
            messages: VecDeque::new(),
            violations: 0,
            blocked_until: None,
            ban: None,
            active_connections: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Remaining block time, clearing an expired block as a side effect.
    pub(crate) fn block_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.blocked_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.blocked_until = None;
                None
            }
            None => None,
        }
    }

    /// True when nothing about this peer is worth remembering.
    pub(crate) fn is_idle(
        &mut self,
        now: Instant,
        attempt_window: Duration,
        message_window: Duration,
    ) -> bool {
        prune_window(&mut self.attempts, now, attempt_window);
        prune_window(&mut self.messages, now, message_window);
        self.active_connections == 0
            && self.ban.is_none()
            && self.block_remaining(now).is_none()
            && self.attempts.is_empty()
            && self.messages.is_empty()
    }
}

/// Drop timestamps older than `now - window`.
pub(crate) fn prune_window(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = stamps.front() {
        if now.duration_since(*front) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Reduce a peer address to its host part so limits apply per host.
///
/// `10.0.0.5:51234` → `10.0.0.5`, `[::1]:80` → `::1`. Anything that does
/// not parse as an address is kept verbatim (trimmed).
#[must_use]
pub fn normalize_peer(addr: &str) -> String {
    let trimmed = addr.trim();
    if let Ok(socket) = trimmed.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return ip.to_string();
    }
    trimmed.to_owned()
}

/// Whether `addr` (IP or IP:port) is a loopback address.
#[must_use]
pub fn is_loopback(addr: &str) -> bool {
    normalize_peer(addr)
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}
