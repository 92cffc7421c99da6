//! Integration tests for connection admission, liveness and room lifecycle.
//!
//! These tests start a real server and connect real clients, verifying the
//! full pipeline from upgrade request to document teardown.

use futures_util::StreamExt;
use scrawl_collab::client::{ClientConfig, ConnectionState, SyncClient};
use scrawl_collab::registry::SessionRegistry;
use scrawl_collab::server::{ServerConfig, SyncServer};
use scrawl_collab::session::ProviderSpec;
use scrawl_collab::storage::MemoryDocCache;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use yrs::Map;

const ROOM: &str = "whiteboard-AB12CD";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    port: u16,
    registry: Arc<SessionRegistry>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap();
    }
}

async fn start_server(heartbeat: Duration) -> TestServer {
    start_server_with(ServerConfig {
        heartbeat_interval: heartbeat,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    }, free_port().await)
    .await
}

async fn start_server_with(config: ServerConfig, port: u16) -> TestServer {
    let config = ServerConfig { bind_addr: format!("127.0.0.1:{port}"), ..config };
    let server = SyncServer::new(config);
    let registry = server.registry().clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    TestServer { port, registry, stop: Some(stop_tx), task }
}

async fn wait_for_members(registry: &SessionRegistry, room: &str, expected: usize) -> bool {
    for _ in 0..150 {
        if registry.member_count(room).await == expected {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
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

fn spec(name: &str, durable: &str) -> ProviderSpec {
    ProviderSpec {
        room: ROOM.into(),
        display_name: name.into(),
        durable_id: durable.into(),
        color: "#333333".into(),
        clear_local_cache: false,
    }
}

async fn connected_client(server: &TestServer, name: &str, durable: &str) -> SyncClient {
    let mut client = SyncClient::new(
        ClientConfig::with_server_url(server.url()),
        &spec(name, durable),
        Arc::new(MemoryDocCache::new()),
    )
    .unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_first_join_creates_room_and_document() {
    let server = start_test_server_default().await;
    let url = format!("{}/{ROOM}?userId=Fox42", server.url());

    let (_ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(wait_for_members(&server.registry, ROOM, 1).await);
    assert!(server.registry.document_exists(ROOM).await);

    let stats = server.registry.stats().await;
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.rooms, 1);
    assert_eq!(stats.documents, 1);
    server.stop().await;
}

async fn start_test_server_default() -> TestServer {
    start_server(Duration::from_secs(30)).await
}

#[tokio::test]
async fn test_duplicate_client_id_refused() {
    let server = start_test_server_default().await;
    let url = format!("{}/{ROOM}?userId=Fox42&clientId=tab-1", server.url());

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    // Admitted connections start with the server's state vector.
    let hello = timeout(Duration::from_secs(2), first.next()).await.unwrap();
    assert!(matches!(hello, Some(Ok(Message::Binary(_)))));

    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let reply = timeout(Duration::from_secs(2), second.next()).await.unwrap();
    assert!(
        !matches!(reply, Some(Ok(Message::Binary(_)))),
        "refused connection must not be synced: {reply:?}"
    );

    let stats = server.registry.stats().await;
    assert_eq!(stats.total_refused, 1);
    assert_eq!(stats.connections, 1);
    assert_eq!(server.registry.member_count(ROOM).await, 1);
    assert!(server.registry.is_client_id_live("tab-1").await);
    server.stop().await;
}

#[tokio::test]
async fn test_last_leave_destroys_document() {
    let server = start_test_server_default().await;
    let url = format!("{}/{ROOM}?userId=Fox42", server.url());

    let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(wait_for_members(&server.registry, ROOM, 2).await);

    a.close(None).await.unwrap();
    assert!(wait_for_members(&server.registry, ROOM, 1).await);
    assert!(server.registry.document_exists(ROOM).await);

    b.close(None).await.unwrap();
    assert!(wait_for_members(&server.registry, ROOM, 0).await);
    assert!(!server.registry.document_exists(ROOM).await);
    assert_eq!(server.registry.stats().await.rooms, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_silent_peer_is_terminated() {
    let server = start_server(Duration::from_millis(100)).await;

    // A raw socket that is never polled never answers a probe.
    let silent_url = format!("{}/{ROOM}?userId=Ghost&clientId=ghost", server.url());
    let (_silent, _) = tokio_tungstenite::connect_async(silent_url.as_str()).await.unwrap();
    let mut live = connected_client(&server, "Fox42", "u-1").await;
    assert!(wait_for_members(&server.registry, ROOM, 2).await);

    // Two missed ticks at most.
    assert!(wait_for_members(&server.registry, ROOM, 1).await);
    assert!(!server.registry.is_client_id_live("ghost").await);
    assert!(server.registry.stats().await.total_terminated >= 1);

    // The responsive client survives further ticks.
    sleep(Duration::from_millis(350)).await;
    assert_eq!(server.registry.member_count(ROOM).await, 1);
    assert_eq!(live.connection_state(), ConnectionState::Connected);

    live.disconnect().await;
    assert!(wait_for_members(&server.registry, ROOM, 0).await);
    assert!(!server.registry.document_exists(ROOM).await);
    server.stop().await;
}

#[tokio::test]
async fn test_edits_reach_other_members_and_late_joiners() {
    let server = start_test_server_default().await;
    let mut alice = connected_client(&server, "Alice", "u-a").await;
    let mut bob = connected_client(&server, "Bob", "u-b").await;
    assert!(wait_for_members(&server.registry, ROOM, 2).await);

    alice
        .edit(|map, txn| {
            map.insert(txn, "shape-1", "rect");
        })
        .await
        .unwrap();
    assert!(wait_until(|| bob.read(|map, txn| map.len(txn)) == 1).await);

    let mut carol = connected_client(&server, "Carol", "u-c").await;
    assert!(wait_until(|| carol.read(|map, txn| map.len(txn)) == 1).await);

    for client in [&mut alice, &mut bob, &mut carol] {
        client.disconnect().await;
    }
    assert!(wait_for_members(&server.registry, ROOM, 0).await);
    server.stop().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_test_server_default().await;
    let mut alice = connected_client(&server, "Alice", "u-a").await;

    let mut other_spec = spec("Bob", "u-b");
    other_spec.room = "whiteboard-ZZZZZZ".into();
    let mut bob = SyncClient::new(
        ClientConfig::with_server_url(server.url()),
        &other_spec,
        Arc::new(MemoryDocCache::new()),
    )
    .unwrap();
    bob.connect().await.unwrap();
    assert!(wait_for_members(&server.registry, "whiteboard-ZZZZZZ", 1).await);

    alice
        .edit(|map, txn| {
            map.insert(txn, "shape-1", "rect");
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.read(|map, txn| map.len(txn)), 0);

    alice.disconnect().await;
    bob.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_drops_everything() {
    let server = start_test_server_default().await;
    let client = connected_client(&server, "Fox42", "u-1").await;
    assert!(wait_for_members(&server.registry, ROOM, 1).await);

    let registry = server.registry.clone();
    server.stop().await;

    let stats = registry.stats().await;
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.rooms, 0);
    assert_eq!(stats.documents, 0);
    assert!(wait_until(|| client.connection_state() == ConnectionState::Disconnected).await);
}

#[tokio::test]
async fn test_member_falling_behind_is_resynced() {
    let server = start_server_with(
        ServerConfig { broadcast_capacity: 2, ..ServerConfig::default() },
        free_port().await,
    )
    .await;
    let mut alice = connected_client(&server, "Alice", "u-a").await;
    let mut bob = connected_client(&server, "Bob", "u-b").await;
    assert!(wait_for_members(&server.registry, ROOM, 2).await);

    // A burst far larger than the room's fan-out buffer.
    for i in 0..300 {
        alice
            .edit(|map, txn| {
                map.insert(txn, format!("shape-{i}"), i as f64);
            })
            .await
            .unwrap();
    }
    assert_eq!(alice.read(|map, txn| map.len(txn)), 300);
    assert!(wait_until(|| bob.read(|map, txn| map.len(txn)) == 300).await);
    assert_eq!(bob.connection_state(), ConnectionState::Connected);

    alice.disconnect().await;
    bob.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_after_server_restart() {
    let port = free_port().await;
    let server = start_server_with(ServerConfig::default(), port).await;
    let mut client = connected_client(&server, "Fox42", "u-1").await;
    client
        .edit(|map, txn| {
            map.insert(txn, "shape-1", "rect");
        })
        .await
        .unwrap();

    server.stop().await;
    assert!(wait_until(|| client.connection_state() == ConnectionState::Disconnected).await);

    let restarted = start_server_with(ServerConfig::default(), port).await;
    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(wait_for_members(&restarted.registry, ROOM, 1).await);

    // The replica pushes its content into the new, empty room.
    let mut observer = connected_client(&restarted, "Bob", "u-b").await;
    assert!(wait_until(|| observer.read(|map, txn| map.len(txn)) == 1).await);

    client.disconnect().await;
    observer.disconnect().await;
    restarted.stop().await;
}
