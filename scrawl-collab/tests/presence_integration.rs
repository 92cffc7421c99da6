//! Presence over a real server: replay to joiners, reconciliation after a
//! reload, cursor throttling and removal on leave.

use scrawl_collab::client::{ClientConfig, SyncClient, SyncEvent};
use scrawl_collab::presence::PresenceConfig;
use scrawl_collab::registry::SessionRegistry;
use scrawl_collab::server::{ServerConfig, SyncServer};
use scrawl_collab::session::ProviderSpec;
use scrawl_collab::storage::MemoryDocCache;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const ROOM: &str = "whiteboard-PRSNCE";

async fn start_test_server() -> (u16, Arc<SessionRegistry>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    let registry = server.registry().clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (port, registry)
}

fn config(port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        presence: PresenceConfig {
            settle_delay: Duration::from_millis(300),
            cursor_min_interval: Duration::from_millis(200),
            ..PresenceConfig::default()
        },
        event_capacity: 256,
    }
}

async fn join(port: u16, name: &str, durable: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let spec = ProviderSpec {
        room: ROOM.into(),
        display_name: name.into(),
        durable_id: durable.into(),
        color: "#333333".into(),
        clear_local_cache: false,
    };
    let mut client = SyncClient::new(config(port), &spec, Arc::new(MemoryDocCache::new())).unwrap();
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for the first event matching `pred`, skipping the rest.
async fn next_matching(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> Option<SyncEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_joiner_sees_existing_participants() {
    let (port, _registry) = start_test_server().await;
    let (alice, _alice_events) = join(port, "Alice", "u-a").await;
    sleep(Duration::from_millis(100)).await;

    let (bob, _bob_events) = join(port, "Bob", "u-b").await;
    assert!(wait_until(|| bob.participants().len() == 2).await);
    assert!(wait_until(|| alice.participants().len() == 2).await);

    let names: Vec<String> = bob.participants().into_iter().map(|p| p.display_name).collect();
    assert!(names.contains(&"Alice".to_string()));
}

#[tokio::test]
async fn test_reload_reconciles_stale_entry() {
    let (port, _registry) = start_test_server().await;
    let (observer, _observer_events) = join(port, "Owl7", "u-observer").await;

    // The pre-reload tab, not yet reaped by the server.
    let (stale, _stale_events) = join(port, "Fox42", "u-1").await;
    let stale_session = stale.session_id();
    sleep(Duration::from_millis(100)).await;

    // The reloaded tab: same durable id and name, new session.
    let (fresh, mut fresh_events) = join(port, "Fox42", "u-1").await;
    assert_ne!(fresh.session_id(), stale_session);

    let event = next_matching(&mut fresh_events, |e| matches!(e, SyncEvent::Reconciled(_))).await;
    assert_eq!(event, Some(SyncEvent::Reconciled(vec![stale_session])));
    assert!(fresh.participants().iter().all(|p| p.session_id != stale_session));

    // The removal reached the rest of the room.
    assert!(
        wait_until(|| observer
            .participants()
            .iter()
            .all(|p| p.session_id != stale_session))
        .await
    );

    // And the server no longer replays it.
    let (late, _late_events) = join(port, "Bee3", "u-late").await;
    sleep(Duration::from_millis(200)).await;
    assert!(late.participants().iter().all(|p| p.session_id != stale_session));
    assert!(late.participants().iter().any(|p| p.session_id == fresh.session_id()));
}

#[tokio::test]
async fn test_different_durable_ids_are_not_reconciled() {
    let (port, _registry) = start_test_server().await;
    let (_a, _a_events) = join(port, "Fox42", "u-1").await;
    sleep(Duration::from_millis(100)).await;
    let (b, mut b_events) = join(port, "Fox42", "u-2").await;

    let reconciled =
        next_matching(&mut b_events, |e| matches!(e, SyncEvent::Reconciled(_))).await;
    assert!(reconciled.is_none());
    assert_eq!(b.participants().len(), 2);
}

#[tokio::test]
async fn test_cursor_updates_are_throttled_and_flushed() {
    let (port, _registry) = start_test_server().await;
    let (alice, _alice_events) = join(port, "Alice", "u-a").await;
    let (bob, _bob_events) = join(port, "Bob", "u-b").await;
    sleep(Duration::from_millis(100)).await;

    assert!(alice.update_cursor(10.0, 20.0).await.unwrap());
    // Inside the minimum interval: coalesced, not sent.
    assert!(!alice.update_cursor(11.0, 21.0).await.unwrap());

    let alice_session = alice.session_id();
    assert!(
        wait_until(|| bob
            .visible_cursors()
            .iter()
            .any(|c| c.session_id == alice_session && c.x == 11.0 && c.y == 21.0))
        .await
    );
}

#[tokio::test]
async fn test_leaving_member_is_removed_from_presence() {
    let (port, registry) = start_test_server().await;
    let (alice, _alice_events) = join(port, "Alice", "u-a").await;
    let (mut bob, _bob_events) = join(port, "Bob", "u-b").await;
    assert!(wait_until(|| alice.participants().len() == 2).await);

    bob.disconnect().await;
    assert!(wait_until(|| alice.participants().len() == 1).await);
    for _ in 0..100 {
        if registry.member_count(ROOM).await == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registry.member_count(ROOM).await, 1);
}
