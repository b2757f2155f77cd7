// Realtime channel liveness and reconnection against a fake Socket.IO server

mod common;

use common::{FakeSocketServer, PingSettings};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::{Duration, Instant};
use store_print_agent::config::Timings;
use store_print_agent::realtime::{RealtimeClient, RealtimeEvent};
use tokio::sync::mpsc::UnboundedReceiver;

async fn next_event(events: &mut UnboundedReceiver<RealtimeEvent>, within: Duration) -> RealtimeEvent {
    tokio::time::timeout(within, events.recv())
        .await
        .expect("no realtime event in time")
        .expect("event channel closed")
}

fn timings(reconnect_delay_ms: u64, reconnect_attempts: Option<usize>) -> Timings {
    Timings {
        reconnect_delay_ms,
        reconnect_attempts,
        ..Timings::default()
    }
}

#[tokio::test]
async fn test_silent_server_is_detected_as_ping_timeout() {
    let ping = PingSettings { interval_ms: 200, timeout_ms: 200, send_pings: false };
    let server = FakeSocketServer::start_with(json!({ "ok": true }), ping).await;
    let (handle, mut events) = RealtimeClient::start(&server.url, "t", &timings(100, None)).unwrap();

    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);

    let connected_at = Instant::now();
    let event = next_event(&mut events, Duration::from_secs(3)).await;
    assert_eq!(event, RealtimeEvent::Disconnected("ping timeout".to_string()));
    assert!(connected_at.elapsed() >= Duration::from_millis(350));

    // and the channel comes back on its own
    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);
    handle.close().await;
}

#[tokio::test]
async fn test_pinging_server_keeps_channel_up() {
    let ping = PingSettings { interval_ms: 100, timeout_ms: 150, send_pings: true };
    let server = FakeSocketServer::start_with(json!({ "ok": true }), ping).await;
    let (handle, mut events) = RealtimeClient::start(&server.url, "t", &timings(100, None)).unwrap();

    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);

    // several liveness windows pass without a drop
    let quiet = tokio::time::timeout(Duration::from_millis(1_000), events.recv()).await;
    assert!(quiet.is_err(), "unexpected event {:?}", quiet);
    assert_eq!(server.connections(), 1);
    handle.close().await;
}

#[tokio::test]
async fn test_reconnect_waits_the_fixed_delay_after_a_drop() {
    let server = FakeSocketServer::start(json!({ "ok": true })).await;
    let (handle, mut events) = RealtimeClient::start(&server.url, "t", &timings(1_000, None)).unwrap();

    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);

    server.drop_clients();
    match next_event(&mut events, Duration::from_secs(5)).await {
        RealtimeEvent::Disconnected(_) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
    let dropped_at = Instant::now();

    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);
    assert!(
        dropped_at.elapsed() >= Duration::from_millis(900),
        "reconnected after {:?}",
        dropped_at.elapsed()
    );
    assert_eq!(server.connections(), 2);
    handle.close().await;
}

#[tokio::test]
async fn test_bounded_reconnect_gives_up_when_server_is_gone() {
    let server = FakeSocketServer::start(json!({ "ok": true })).await;
    let (handle, mut events) = RealtimeClient::start(&server.url, "t", &timings(100, Some(2))).unwrap();

    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::Connected);

    server.stop();
    match next_event(&mut events, Duration::from_secs(5)).await {
        RealtimeEvent::Disconnected(_) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(next_event(&mut events, Duration::from_secs(5)).await, RealtimeEvent::ReconnectFailed);
    handle.close().await;
}
