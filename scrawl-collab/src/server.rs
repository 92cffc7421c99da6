//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /whiteboard-AB12CD?userId=..&clientId=..
//!            ├── SessionRegistry ── Room ── DocumentHandle (yrs)
//! Client B ──┘        │               │
//!                     │               └── BroadcastGroup ──► members
//!                     │
//!         ┌───────────┴────────────┐
//!         ▼                        ▼
//!   heartbeat (30s)          compaction (1800s)
//!   ping / terminate         live documents only
//! ```
//!
//! One task per connection. The task owns its socket; the registry reaches
//! it through a control channel (probe, terminate). Whatever ends the task
//! (close frame, transport error, termination) runs the same cleanup.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::Control;
use crate::document::DocumentError;
use crate::error::CollabError;
use crate::presence::AwarenessMessage;
use crate::protocol::{ConnectParams, MessageType, SyncMessage};
use crate::registry::{Admission, RegistryStats, SessionRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Liveness probe period
    pub heartbeat_interval: Duration,
    /// Document compaction period
    pub compaction_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5678".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            compaction_interval: Duration::from_secs(1800),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.broadcast_capacity));
        Self { config, registry }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared state, for inspection.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<(), CollabError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop both sweeps, destroy every
    /// document and drop every connection.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| CollabError::Setup(format!("bind {}: {e}", self.config.bind_addr)))?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = spawn_sweep(
            "heartbeat",
            self.config.heartbeat_interval,
            stop_rx.clone(),
            self.registry.clone(),
            |registry| async move {
                let report = registry.heartbeat_tick().await;
                if report.terminated > 0 {
                    log::info!(
                        "Heartbeat: {} probed, {} terminated",
                        report.probed,
                        report.terminated
                    );
                }
            },
        );
        let compaction = spawn_sweep(
            "compaction",
            self.config.compaction_interval,
            stop_rx,
            self.registry.clone(),
            |registry| async move {
                registry.compaction_sweep().await;
            },
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, registry).await {
                                log::debug!("Connection from {addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
            }
        }

        let _ = stop_tx.send(true);
        let _ = heartbeat.await;
        let _ = compaction.await;
        self.registry.shutdown().await;
        log::info!("Sync server stopped");
        Ok(())
    }
}

/// Run `tick` every `period` until `stop` flips.
fn spawn_sweep<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    registry: Arc<SessionRegistry>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<SessionRegistry>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick(registry.clone()).await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("{name} sweep stopped");
    })
}

/// Upgrade, admit, pump, clean up.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
) -> Result<(), CollabError> {
    let mut target: Option<(String, Option<String>)> = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        target = Some((
            req.uri().path().to_string(),
            req.uri().query().map(str::to_string),
        ));
        Ok(resp)
    })
    .await?;

    let (path, query) = target.unwrap_or_else(|| ("/".to_string(), None));
    let params = ConnectParams::from_request_target(&path, query.as_deref());

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let admission = match registry.admit(&params, control_tx).await {
        Ok(admission) => admission,
        Err(e) => {
            let _ = ws.send(Message::Close(None)).await;
            return Err(e);
        }
    };
    let id = admission.id;
    log::debug!("WebSocket {id} established from {addr}");

    let result = pump(ws, admission, control_rx, &registry).await;
    registry.leave(id).await;
    result
}

/// Per-connection loop: client frames, room frames, registry control.
async fn pump(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    admission: Admission,
    mut control: mpsc::UnboundedReceiver<Control>,
    registry: &SessionRegistry,
) -> Result<(), CollabError> {
    let Admission { id, room, document, broadcast, mut frames, presence, .. } = admission;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    // Initial sync: our state vector, our full state, current presence.
    let sv = document.state_vector()?;
    ws_sender
        .send(Message::Binary(SyncMessage::sync_step1(sv).encode()?.into()))
        .await?;
    let full = document.full_state()?;
    ws_sender
        .send(Message::Binary(SyncMessage::sync_step2(full).encode()?.into()))
        .await?;
    for frame in presence {
        ws_sender.send(Message::Binary(frame.into())).await?;
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Dropping malformed frame from {id}: {e}");
                            continue;
                        }
                    };
                    match sync_msg.msg_type {
                        MessageType::SyncStep1 => match document.diff(&sync_msg.payload) {
                            Ok(diff) => {
                                let reply = SyncMessage::sync_step2(diff).encode()?;
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                            Err(DocumentError::Destroyed(_)) => break,
                            Err(e) => log::warn!("Bad state vector from {id}: {e}"),
                        },
                        MessageType::SyncStep2 | MessageType::Update => {
                            match document.apply_update(&sync_msg.payload) {
                                Ok(()) => {
                                    let relay = if sync_msg.msg_type == MessageType::Update {
                                        bytes
                                    } else {
                                        SyncMessage::update(sync_msg.payload).encode()?
                                    };
                                    broadcast.broadcast_raw(Some(id), relay);
                                }
                                Err(DocumentError::Destroyed(_)) => break,
                                Err(e) => log::warn!("Rejected update from {id} in {room}: {e}"),
                            }
                        }
                        MessageType::Awareness => match AwarenessMessage::decode(&sync_msg.payload) {
                            Ok(awareness) => {
                                if let Some(group) = registry.record_awareness(id, &awareness, &bytes).await {
                                    group.broadcast_raw(Some(id), bytes);
                                }
                            }
                            Err(e) => log::warn!("Dropping malformed presence from {id}: {e}"),
                        },
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    registry.mark_alive(id).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("{id} closed");
                    break;
                }
                Some(Err(e)) => {
                    log::debug!("{id} transport error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },

            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if frame.is_for(id) {
                        ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Skipped updates are gone from the channel; resend the
                    // whole document and the room's presence instead.
                    log::warn!("{id} lagged by {n} frames in {room}, resyncing");
                    let full = match document.full_state() {
                        Ok(full) => full,
                        Err(DocumentError::Destroyed(_)) => break,
                        Err(e) => return Err(e.into()),
                    };
                    ws_sender
                        .send(Message::Binary(SyncMessage::sync_step2(full).encode()?.into()))
                        .await?;
                    for frame in registry.presence_frames(&room).await {
                        ws_sender.send(Message::Binary(frame.into())).await?;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            ctrl = control.recv() => match ctrl {
                Some(Control::Probe) => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
                Some(Control::Terminate) | None => {
                    log::debug!("{id} terminated by registry");
                    break;
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5678");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.compaction_interval, Duration::from_secs(1800));
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.config().broadcast_capacity, 512);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats, RegistryStats::default());
    }

    #[tokio::test]
    async fn test_bind_failure_is_setup_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let server = SyncServer::new(ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::default()
        });
        let err = server.run_until(async {}).await.unwrap_err();
        assert!(err.is_fatal_to_session());
    }

    #[tokio::test]
    async fn test_run_until_returns_on_shutdown() {
        let server = SyncServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        });
        server.run_until(async {}).await.unwrap();
    }
}
