//! WebSocket sync client: the network provider for one room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Two-way document sync against a local `yrs::Doc` replica
//! - Local document cache (loaded before connecting, saved on every change)
//! - Presence: announce, throttled cursor, tool, delayed reconciliation
//!
//! Every background task the client spawns is tracked and aborted on
//! [`SyncClient::disconnect`] or drop, so a torn-down provider cannot keep
//! publishing presence or applying updates next to its replacement.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, MapRef, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update};

use crate::document::DocumentError;
use crate::error::CollabError;
use crate::presence::{
    new_session_id, unix_millis, AwarenessMessage, Participant, PresenceChannel, PresenceConfig,
    PresenceState, RemoteCursor, SessionId,
};
use crate::protocol::{ConnectParams, MessageType, SyncMessage};
use crate::session::{Provider, ProviderFactory, ProviderSpec};
use crate::storage::DocCache;

/// Root map holding the drawing surface.
pub const WHITEBOARD_MAP: &str = "whiteboard";

/// How long the server may take to open the sync exchange after the upgrade.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);

type WsReader = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Server answered our state vector
    Synced,
    /// A remote edit was merged into the local replica
    RemoteUpdate,
    /// Presence entries changed
    PresenceChanged(Vec<SessionId>),
    /// Stale entries of our own earlier sessions were removed
    Reconciled(Vec<SessionId>),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `ws://127.0.0.1:5678`
    pub server_url: String,
    pub presence: PresenceConfig,
    /// Event channel capacity; events beyond it are dropped
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5678".to_string(),
            presence: PresenceConfig::default(),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), ..Self::default() }
    }
}

/// State shared between the client handle and its tasks.
struct Shared {
    room: String,
    doc: Mutex<Doc>,
    presence: Mutex<PresenceChannel>,
    cache: Arc<dyn DocCache>,
    state: RwLock<ConnectionState>,
}

impl Shared {
    fn apply_remote(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let doc = self.doc.lock();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(self.doc.lock().transact().encode_diff_v1(&sv))
    }

    fn full_state(&self) -> Vec<u8> {
        self.doc
            .lock()
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Save the replica to the local cache. Failures only cost a warm start.
    fn persist(&self) {
        if let Err(e) = self.cache.save(&self.room, &self.full_state()) {
            log::warn!("Failed to cache document for {}: {e}", self.room);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

fn frame(msg: &SyncMessage) -> Result<Message, CollabError> {
    Ok(Message::Binary(msg.encode()?.into()))
}

fn presence_frame(msg: &AwarenessMessage) -> Result<Message, CollabError> {
    frame(&msg.to_sync_message()?)
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    params: ConnectParams,
    shared: Arc<Shared>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    cursor_wake: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Build a provider for `spec.room` with a fresh session id.
    ///
    /// The local cache is cleared first when `spec.clear_local_cache` is set, then
    /// loaded into the replica.
    pub fn new(
        config: ClientConfig,
        spec: &ProviderSpec,
        cache: Arc<dyn DocCache>,
    ) -> Result<Self, CollabError> {
        if !(config.server_url.starts_with("ws://") || config.server_url.starts_with("wss://")) {
            return Err(CollabError::Setup(format!(
                "server url must be ws:// or wss://, got {}",
                config.server_url
            )));
        }

        if spec.clear_local_cache {
            cache.clear(&spec.room)?;
            log::info!("New room {}: local cache cleared", spec.room);
        }

        let doc = Doc::new();
        match cache.load(&spec.room) {
            Ok(Some(state)) => {
                let restored = Update::decode_v1(&state)
                    .map_err(|e| e.to_string())
                    .and_then(|u| doc.transact_mut().apply_update(u).map_err(|e| e.to_string()));
                match restored {
                    Ok(()) => log::info!("Restored cached document for {}", spec.room),
                    Err(e) => {
                        log::warn!("Discarding unreadable cache for {}: {e}", spec.room);
                        cache.clear(&spec.room)?;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Local cache unavailable for {}: {e}", spec.room),
        }

        let session = new_session_id();
        let local = PresenceState::new(
            spec.display_name.clone(),
            Some(spec.durable_id.clone()),
            spec.color.clone(),
        );
        let presence = PresenceChannel::new(session, local, config.presence.clone());
        let params = ConnectParams::new(spec.room.clone(), spec.display_name.clone())
            .with_client_id(session.to_string())
            .with_durable_id(spec.durable_id.clone());

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Ok(Self {
            config,
            params,
            shared: Arc::new(Shared {
                room: spec.room.clone(),
                doc: Mutex::new(doc),
                presence: Mutex::new(presence),
                cache,
                state: RwLock::new(ConnectionState::Disconnected),
            }),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            cursor_wake: Arc::new(Notify::new()),
            tasks: Vec::new(),
            writer: None,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Returns once the server has opened the sync exchange; a connection the
    /// server closes instead (e.g. a live duplicate client id) is an error.
    /// Spawns the writer, reader, reconciliation and cursor tasks.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        if self.outgoing_tx.is_some() {
            if self.connection_state() == ConnectionState::Connected {
                return Ok(());
            }
            // The transport dropped; the old tasks are talking to a dead socket.
            self.abort_tasks();
            log::debug!("Clearing dead connection to {} before redialing", self.params.room);
        }
        self.shared.set_state(ConnectionState::Connecting);

        let url = format!(
            "{}{}",
            self.config.server_url.trim_end_matches('/'),
            self.params.to_request_target()
        );
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                log::warn!("Could not reach {url}: {e}");
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let opened = tokio::time::timeout(
            ADMISSION_TIMEOUT,
            self.open_sync(&out_tx, &mut ws_reader),
        )
        .await
        .unwrap_or_else(|_| Err(CollabError::Transport("no sync from server".into())));
        if let Err(e) = opened {
            writer.abort();
            self.shared.set_state(ConnectionState::Disconnected);
            log::warn!("Not admitted to {}: {e}", self.params.room);
            return Err(e);
        }
        self.writer = Some(writer);
        self.outgoing_tx = Some(out_tx.clone());
        self.shared.set_state(ConnectionState::Connected);
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        log::info!(
            "Connected to {} as {} (session {})",
            self.params.room,
            self.params.display_name,
            self.session_id()
        );

        // Reader task: process incoming WebSocket messages
        let shared = self.shared.clone();
        let out = out_tx.clone();
        let events = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Err(e) = handle_frame(&shared, &out, &events, &bytes).await {
                            log::warn!("Dropping frame in {}: {e}", shared.room);
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = out.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            shared.set_state(ConnectionState::Disconnected);
            let _ = events.try_send(SyncEvent::Disconnected);
            log::info!("Disconnected from {}", shared.room);
        }));

        // Reconciliation, once the connection has settled.
        let shared = self.shared.clone();
        let out = out_tx.clone();
        let events = self.event_tx.clone();
        let settle = self.config.presence.settle_delay;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if *shared.state.read() != ConnectionState::Connected {
                return;
            }
            let result = shared.presence.lock().reconcile();
            if let Some(msg) = result.message {
                match presence_frame(&msg) {
                    Ok(f) => {
                        let _ = out.send(f).await;
                    }
                    Err(e) => log::error!("Failed to encode reconciliation: {e}"),
                }
                let _ = events.try_send(SyncEvent::Reconciled(result.removed));
            }
        }));

        // Debounced cursor flush.
        let shared = self.shared.clone();
        let out = out_tx;
        let wake = self.cursor_wake.clone();
        let min_interval = self.config.presence.cursor_min_interval;
        self.tasks.push(tokio::spawn(async move {
            'wake: loop {
                wake.notified().await;
                loop {
                    tokio::time::sleep(min_interval).await;
                    let (msg, still_pending) = {
                        let mut presence = shared.presence.lock();
                        let msg = presence.flush_pending_cursor(unix_millis());
                        (msg, presence.has_pending_cursor())
                    };
                    if let Some(msg) = msg {
                        if let Ok(f) = presence_frame(&msg) {
                            if out.send(f).await.is_err() {
                                break 'wake;
                            }
                        }
                    }
                    if !still_pending {
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Send our half of the initial sync and our presence, then wait for the
    /// server's state vector, which it only sends to admitted connections.
    async fn open_sync(
        &self,
        out: &mpsc::Sender<Message>,
        reader: &mut WsReader,
    ) -> Result<(), CollabError> {
        let step1 = frame(&SyncMessage::sync_step1(self.shared.state_vector()))?;
        let announce = presence_frame(&self.shared.presence.lock().announce())?;
        for msg in [step1, announce] {
            out.send(msg)
                .await
                .map_err(|_| CollabError::Transport("writer closed".into()))?;
        }

        while let Some(msg) = reader.next().await {
            match msg? {
                Message::Binary(data) => {
                    let bytes: Vec<u8> = data.into();
                    let opening = SyncMessage::decode(&bytes)?.msg_type == MessageType::SyncStep1;
                    handle_frame(&self.shared, out, &self.event_tx, &bytes).await?;
                    if opening {
                        return Ok(());
                    }
                }
                Message::Ping(data) => {
                    let _ = out.send(Message::Pong(data)).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(CollabError::Transport("connection closed by server".into()))
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    /// Close the connection and stop every background task.
    pub async fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                abort.abort();
            }
        }
        self.shared.persist();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn send(&self, msg: Message) -> Result<bool, CollabError> {
        match &self.outgoing_tx {
            Some(tx) if self.connection_state() == ConnectionState::Connected => {
                tx.send(msg)
                    .await
                    .map_err(|_| CollabError::Transport("writer closed".into()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Edit the shared map in one transaction and publish the resulting update.
    ///
    /// Offline edits stay in the replica and reach the server with the next
    /// sync exchange.
    pub async fn edit<R>(
        &self,
        f: impl FnOnce(&MapRef, &mut TransactionMut) -> R,
    ) -> Result<R, CollabError> {
        let (result, update) = {
            let doc = self.shared.doc.lock();
            let map = doc.get_or_insert_map(WHITEBOARD_MAP);
            let mut txn = doc.transact_mut();
            let result = f(&map, &mut txn);
            let update = txn.encode_update_v1();
            (result, update)
        };
        self.shared.persist();
        self.send(frame(&SyncMessage::update(update))?).await?;
        Ok(result)
    }

    /// Read the shared map.
    pub fn read<R>(&self, f: impl FnOnce(&MapRef, &Transaction) -> R) -> R {
        let doc = self.shared.doc.lock();
        let map = doc.get_or_insert_map(WHITEBOARD_MAP);
        let txn = doc.transact();
        f(&map, &txn)
    }

    /// Publish a pointer position. Returns `false` when it was coalesced for
    /// a later flush or the client is offline.
    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<bool, CollabError> {
        let msg = self.shared.presence.lock().update_cursor(x, y, unix_millis());
        match msg {
            Some(msg) => self.send(presence_frame(&msg)?).await,
            None => {
                if self.shared.presence.lock().has_pending_cursor() {
                    self.cursor_wake.notify_one();
                }
                Ok(false)
            }
        }
    }

    pub async fn set_active_tool(&self, tool: &str) -> Result<bool, CollabError> {
        let msg = self.shared.presence.lock().set_active_tool(tool);
        self.send(presence_frame(&msg)?).await
    }

    pub fn visible_cursors(&self) -> Vec<RemoteCursor> {
        self.shared.presence.lock().visible_cursors(unix_millis())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.shared.presence.lock().participants()
    }

    /// Drop remote entries whose cursor went quiet long ago.
    pub fn purge_expired(&self) -> Vec<SessionId> {
        self.shared.presence.lock().purge_expired(unix_millis())
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.presence.lock().local_session()
    }

    pub fn room(&self) -> &str {
        &self.params.room
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn handle_frame(
    shared: &Shared,
    out: &mpsc::Sender<Message>,
    events: &mpsc::Sender<SyncEvent>,
    bytes: &[u8],
) -> Result<(), CollabError> {
    let msg = SyncMessage::decode(bytes)?;
    match msg.msg_type {
        MessageType::SyncStep1 => {
            let diff = shared.diff(&msg.payload)?;
            out.send(frame(&SyncMessage::sync_step2(diff))?)
                .await
                .map_err(|_| CollabError::Transport("writer closed".into()))?;
        }
        MessageType::SyncStep2 => {
            shared.apply_remote(&msg.payload)?;
            shared.persist();
            let _ = events.try_send(SyncEvent::Synced);
        }
        MessageType::Update => {
            shared.apply_remote(&msg.payload)?;
            shared.persist();
            let _ = events.try_send(SyncEvent::RemoteUpdate);
        }
        MessageType::Awareness => {
            let awareness = AwarenessMessage::decode(&msg.payload)?;
            let changed = shared.presence.lock().apply(&awareness);
            if !changed.is_empty() {
                let _ = events.try_send(SyncEvent::PresenceChanged(changed));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Provider for SyncClient {
    fn room(&self) -> &str {
        &self.params.room
    }

    async fn shutdown(&mut self) {
        self.disconnect().await;
    }
}

/// Builds connected [`SyncClient`]s sharing one local cache.
pub struct SyncClientFactory {
    config: ClientConfig,
    cache: Arc<dyn DocCache>,
}

impl SyncClientFactory {
    pub fn new(config: ClientConfig, cache: Arc<dyn DocCache>) -> Self {
        Self { config, cache }
    }
}

#[async_trait]
impl ProviderFactory for SyncClientFactory {
    type Provider = SyncClient;

    async fn create(&self, spec: ProviderSpec) -> Result<SyncClient, CollabError> {
        let mut client = SyncClient::new(self.config.clone(), &spec, self.cache.clone())?;
        client.connect().await?;
        Ok(client)
    }
}
