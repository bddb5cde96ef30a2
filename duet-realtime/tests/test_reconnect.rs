//! Reconnect, backoff and heartbeat behavior, on a paused clock.

mod common;

use std::time::Duration;

use common::{test_settings, Harness};
use duet_realtime::{Command, ConnectionState, Frame, SyncEvent};

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_then_gives_up() {
    let mut harness = Harness::new(test_settings(), u32::MAX);
    harness.start().await;

    let event = harness.next_event().await;
    assert!(
        matches!(&event, SyncEvent::Error(msg) if msg.contains("3 reconnect attempts")),
        "unexpected event: {event:?}"
    );

    // One initial attempt plus three reconnects.
    assert_eq!(harness.connector.attempt_count(), 4);
    assert_eq!(
        harness.connector.gaps(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(harness.client.state().await, ConnectionState::Disconnected);

    // Terminal: nothing else is scheduled.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.connector.attempt_count(), 4);
    assert!(harness.try_event().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let mut harness = Harness::new(test_settings(), u32::MAX);
    harness.start().await;

    // The first attempt fails at once and a reconnect is scheduled for +1 s.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.connector.attempt_count(), 1);
    assert_eq!(harness.client.reconnect_attempts().await, 1);

    harness.client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.connector.attempt_count(), 1);
    assert_eq!(harness.client.state().await, ConnectionState::Disconnected);
    assert_eq!(harness.client.reconnect_attempts().await, 0);
    // Never connected, so no Disconnected event either.
    assert!(harness.try_event().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_successful_connect_resets_attempts() {
    let mut harness = Harness::new(test_settings(), 2);
    harness.start().await;

    // Two refusals (1 s, 2 s), then the broker answers.
    let mut server = harness.next_server().await;
    server.accept_and_subscriptions("0,0").await;
    assert_eq!(harness.next_event().await, SyncEvent::Connected);
    assert_eq!(harness.client.reconnect_attempts().await, 0);
    assert_eq!(harness.connector.attempt_count(), 3);

    drop(server);
    let event = harness.next_event().await;
    assert!(
        matches!(&event, SyncEvent::Disconnected { reason: Some(r) } if r.contains("closed")),
        "unexpected event: {event:?}"
    );

    // Backoff restarts from the base delay.
    let mut server = harness.next_server().await;
    assert_eq!(harness.connector.gaps().last(), Some(&Duration::from_secs(1)));
    server.accept_and_subscriptions("0,0").await;
    assert_eq!(harness.next_event().await, SyncEvent::Connected);
    assert_eq!(harness.client.state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_missed_server_heartbeat_triggers_reconnect() {
    let mut settings = test_settings();
    settings.heartbeat_ms = (0, 1_000);
    let mut harness = Harness::new(settings, 0);
    harness.start().await;

    let mut server = harness.next_server().await;
    server.accept_and_subscriptions("1000,0").await;
    assert_eq!(harness.next_event().await, SyncEvent::Connected);

    // Heartbeats inside the 2 s grace window keep the session up.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        server.send_raw("\n").await;
    }
    assert!(harness.try_event().is_none());
    assert_eq!(harness.connector.attempt_count(), 1);

    // Silence past twice the interval drops the connection.
    let event = harness.next_event().await;
    assert!(
        matches!(&event, SyncEvent::Disconnected { reason: Some(r) } if r.contains("heartbeat")),
        "unexpected event: {event:?}"
    );
    let _server = harness.next_server().await;
    assert_eq!(harness.connector.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_heartbeats_at_negotiated_interval() {
    let mut settings = test_settings();
    settings.heartbeat_ms = (1_000, 0);
    let mut harness = Harness::new(settings, 0);
    harness.start().await;

    let mut server = harness.next_server().await;
    server.accept_and_subscriptions("0,1000").await;
    assert_eq!(harness.next_event().await, SyncEvent::Connected);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(server.drain_heartbeats(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_frame_triggers_reconnect() {
    let mut harness = Harness::new(test_settings(), 0);
    let server = harness.connected().await;

    server
        .send_frame(Frame::new(Command::Error).header("message", "session expired"))
        .await;
    let event = harness.next_event().await;
    assert!(
        matches!(&event, SyncEvent::Disconnected { reason: Some(r) } if r.contains("session expired")),
        "unexpected event: {event:?}"
    );

    let _server = harness.next_server().await;
    assert_eq!(harness.connector.gaps(), vec![Duration::from_secs(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_triggers_reconnect() {
    let mut harness = Harness::new(test_settings(), 0);
    let server = harness.connected().await;

    server.fail("connection reset by peer").await;
    let event = harness.next_event().await;
    assert!(matches!(event, SyncEvent::Disconnected { reason: Some(_) }));
    assert_eq!(harness.client.state().await, ConnectionState::Disconnected);

    let mut server = harness.next_server().await;
    server.accept_and_subscriptions("0,0").await;
    assert_eq!(harness.next_event().await, SyncEvent::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_refusal_counts_as_failed_attempt() {
    let mut harness = Harness::new(test_settings(), 0);
    harness.start().await;

    let mut server = harness.next_server().await;
    let connect = server.next_frame().await;
    assert_eq!(connect.command, Command::Connect);
    server
        .send_frame(Frame::new(Command::Error).header("message", "bad token"))
        .await;

    // No Connected was ever emitted, so the retry is silent.
    let _server = harness.next_server().await;
    assert_eq!(harness.connector.attempt_count(), 2);
    assert!(harness.try_event().is_none());
}
