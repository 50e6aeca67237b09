//! Unit tests for per-peer admission, message limiting, and bans.
//!
//! The guard keys its sliding windows on `tokio::time::Instant`, so these
//! tests run on a paused clock and move time with `advance`.

use std::time::Duration;

use agent_gateway::config::GuardLimits;
use agent_gateway::guard::{ConnectionGuard, HistoryAction};

fn limits() -> GuardLimits {
    GuardLimits {
        connection_attempt_window_seconds: 60,
        max_connection_attempts_per_window: 10,
        max_concurrent_connections_per_peer: 4,
        client_message_window_seconds: 10,
        max_client_messages_per_window: 3,
        dos_violation_threshold: 3,
        dos_block_seconds: 300,
        history_capacity: 100,
    }
}

#[tokio::test(start_paused = true)]
async fn single_attempt_window_escalates_to_block() {
    let guard = ConnectionGuard::new(GuardLimits {
        max_connection_attempts_per_window: 1,
        dos_violation_threshold: 1,
        ..limits()
    });

    let first = guard.try_open_connection("10.0.0.1:5000", "stream");
    assert!(first.allowed);
    assert_eq!(first.peer, "10.0.0.1");

    let second = guard.try_open_connection("10.0.0.1:5001", "stream");
    assert!(!second.allowed);
    assert!(second
        .denied_reason
        .as_deref()
        .expect("reason")
        .contains("connection attempts exceeded"));

    let third = guard.try_open_connection("10.0.0.1:5002", "stream");
    assert!(!third.allowed);
    assert!(third
        .denied_reason
        .as_deref()
        .expect("reason")
        .contains("temporarily blocked"));
}

#[tokio::test(start_paused = true)]
async fn block_expires_after_block_seconds() {
    let guard = ConnectionGuard::new(GuardLimits {
        max_connection_attempts_per_window: 1,
        dos_violation_threshold: 1,
        dos_block_seconds: 30,
        ..limits()
    });

    assert!(guard.try_open_connection("10.0.0.2", "stream").allowed);
    guard.close_connection("10.0.0.2");
    assert!(!guard.try_open_connection("10.0.0.2", "stream").allowed);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!guard.try_open_connection("10.0.0.2", "stream").allowed);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(guard.try_open_connection("10.0.0.2", "stream").allowed);
}

#[tokio::test(start_paused = true)]
async fn attempts_slide_out_of_the_window() {
    let guard = ConnectionGuard::new(GuardLimits {
        max_connection_attempts_per_window: 2,
        ..limits()
    });

    for _ in 0..2 {
        assert!(guard.try_open_connection("10.0.0.3", "stream").allowed);
        guard.close_connection("10.0.0.3");
    }
    assert!(!guard.try_open_connection("10.0.0.3", "stream").allowed);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(guard.try_open_connection("10.0.0.3", "stream").allowed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connection_cap_is_per_host() {
    let guard = ConnectionGuard::new(GuardLimits {
        max_concurrent_connections_per_peer: 2,
        ..limits()
    });

    assert!(guard.try_open_connection("10.0.0.4:1", "stream").allowed);
    assert!(guard.try_open_connection("10.0.0.4:2", "stream").allowed);
    let denied = guard.try_open_connection("10.0.0.4:3", "stream");
    assert!(!denied.allowed);
    assert!(denied
        .denied_reason
        .expect("reason")
        .contains("active connections"));

    // A different host is unaffected.
    assert!(guard.try_open_connection("10.0.0.5:1", "stream").allowed);

    guard.close_connection("10.0.0.4:1");
    assert!(guard.try_open_connection("10.0.0.4:4", "stream").allowed);
}

#[tokio::test(start_paused = true)]
async fn message_limiter_drops_then_recovers() {
    let guard = ConnectionGuard::new(limits());

    for _ in 0..3 {
        assert!(guard.try_register_client_message("10.0.0.6:7", "stream"));
    }
    assert!(!guard.try_register_client_message("10.0.0.6:8", "stream"));

    let history = guard.connection_history(0);
    let last = history.last().expect("history entry");
    assert_eq!(last.action, HistoryAction::MessageDenied);
    assert!(!last.allowed);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(guard.try_register_client_message("10.0.0.6", "stream"));
}

#[tokio::test]
async fn ban_blocks_every_port_until_unbanned() {
    let guard = ConnectionGuard::new(limits());

    assert!(guard.ban_peer("192.168.1.9:4000", "abuse", "operator"));
    assert!(!guard.ban_peer("192.168.1.9", "again", "operator"));
    assert!(guard.is_banned("192.168.1.9:1234"));

    let denied = guard.try_open_connection("192.168.1.9:5555", "stream");
    assert!(!denied.allowed);
    assert_eq!(denied.denied_reason.as_deref(), Some("peer is banned"));

    let banned = guard.banned_peers();
    assert_eq!(banned.len(), 1);
    assert_eq!(banned[0].peer, "192.168.1.9");
    assert_eq!(banned[0].ban.reason, "abuse");
    assert_eq!(banned[0].ban.actor, "operator");

    assert!(guard.unban_peer("192.168.1.9", "operator"));
    assert!(!guard.unban_peer("192.168.1.9", "operator"));
    assert!(guard.try_open_connection("192.168.1.9:5556", "stream").allowed);
}

#[tokio::test]
async fn banned_peer_nests_ban_record_on_the_wire() {
    let guard = ConnectionGuard::new(limits());
    guard.ban_peer("10.4.4.4", "scraping", "http");

    let json = serde_json::to_value(guard.banned_peers()).expect("json");
    assert_eq!(json[0]["peer"], "10.4.4.4");
    assert_eq!(json[0]["ban"]["reason"], "scraping");
    assert_eq!(json[0]["ban"]["actor"], "http");
    assert!(json[0].get("reason").is_none());
}

#[tokio::test]
async fn connected_peers_only_lists_open_connections() {
    let guard = ConnectionGuard::new(limits());
    assert!(guard.try_open_connection("10.1.0.2:1", "stream").allowed);
    assert!(guard.try_open_connection("10.1.0.1:1", "stream").allowed);
    guard.close_connection("10.1.0.2:1");

    let peers = guard.connected_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer, "10.1.0.1");
    assert_eq!(peers[0].active_connections, 1);
}

#[tokio::test]
async fn history_records_open_close_and_denials() {
    let guard = ConnectionGuard::new(limits());
    guard.ban_peer("10.2.0.1", "test", "unit");
    let _ = guard.try_open_connection("10.2.0.1:1", "stream");
    assert!(guard.try_open_connection("10.2.0.2:1", "stream").allowed);
    guard.close_connection("10.2.0.2:1");

    let actions: Vec<HistoryAction> = guard
        .connection_history(0)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            HistoryAction::Ban,
            HistoryAction::ConnectionDenied,
            HistoryAction::ConnectionOpen,
            HistoryAction::ConnectionClose,
        ]
    );
    assert_eq!(guard.connection_history(2).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn prune_idle_forgets_quiet_peers_but_keeps_bans() {
    let guard = ConnectionGuard::new(limits());
    assert!(guard.try_open_connection("10.3.0.1", "stream").allowed);
    guard.close_connection("10.3.0.1");
    guard.ban_peer("10.3.0.2", "test", "unit");

    assert_eq!(guard.prune_idle(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(guard.prune_idle(), 1);
    assert!(guard.is_banned("10.3.0.2"));
}

#[tokio::test(start_paused = true)]
async fn updated_limits_apply_to_next_attempt() {
    let guard = ConnectionGuard::new(limits());
    assert!(guard.try_open_connection("10.4.0.1", "stream").allowed);

    guard.update_limits(GuardLimits {
        max_concurrent_connections_per_peer: 1,
        ..limits()
    });
    assert_eq!(guard.limits().max_concurrent_connections_per_peer, 1);
    assert!(!guard.try_open_connection("10.4.0.1", "stream").allowed);
}
