//! The server's single injectable state object.
//!
//! ```text
//!                    SessionRegistry (one tokio Mutex)
//!  ┌────────────────────┬─────────────────────┬──────────────────────┐
//!  │ ConnectionRegistry │ RoomRegistry        │ DocumentRegistry     │
//!  │ conn → room, ids,  │ room → members,     │ room → DocumentHandle│
//!  │ liveness           │ broadcast, presence │                      │
//!  └────────────────────┴─────────────────────┴──────────────────────┘
//! ```
//!
//! Membership changes and the paired document lifecycle happen under the
//! same lock, so `member_count(room) == 0` exactly when no document exists
//! for `room`. When the last member leaves, the document is destroyed first
//! and the room entry removed second.
//!
//! Nothing here touches the network while the lock is held. Mutating
//! operations collect the probes, terminations and presence removals they
//! imply and deliver them after the lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::connection::{ConnectionId, ConnectionRegistry, Control, ControlSender};
use crate::document::{DocumentHandle, DocumentRegistry};
use crate::error::CollabError;
use crate::presence::AwarenessMessage;
use crate::protocol::ConnectParams;
use crate::room::RoomRegistry;

/// Everything a freshly admitted connection needs.
pub struct Admission {
    pub id: ConnectionId,
    pub room: String,
    pub document: Arc<DocumentHandle>,
    pub broadcast: Arc<BroadcastGroup>,
    /// Subscribed under the registry lock, so no frame sent after the join
    /// is missed.
    pub frames: broadcast::Receiver<Arc<Frame>>,
    /// Cached presence frames of the other members.
    pub presence: Vec<Vec<u8>>,
    pub members: usize,
}

/// What happened to a departing connection's room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: String,
    pub remaining: usize,
    pub room_removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub probed: usize,
    pub terminated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub rooms: usize,
    pub documents: usize,
    pub total_admitted: u64,
    pub total_refused: u64,
    pub total_terminated: u64,
    pub compactions: u64,
}

struct Inner {
    connections: ConnectionRegistry,
    rooms: RoomRegistry,
    documents: DocumentRegistry,
}

/// Presence removal to publish once the lock is released.
struct PendingRemoval {
    broadcast: Arc<BroadcastGroup>,
    session_ids: Vec<u64>,
}

impl PendingRemoval {
    fn send(self) {
        let msg = AwarenessMessage::Remove { session_ids: self.session_ids };
        match msg.to_sync_message().and_then(|m| m.encode()) {
            Ok(bytes) => {
                self.broadcast.broadcast_raw(None, bytes);
            }
            Err(e) => log::error!("Failed to encode presence removal: {e}"),
        }
    }
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    total_admitted: AtomicU64,
    total_refused: AtomicU64,
    total_terminated: AtomicU64,
    compactions: AtomicU64,
}

impl SessionRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: ConnectionRegistry::new(),
                rooms: RoomRegistry::new(broadcast_capacity),
                documents: DocumentRegistry::new(),
            }),
            total_admitted: AtomicU64::new(0),
            total_refused: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        }
    }

    /// Admit a connection into its room, creating room and document on first join.
    ///
    /// A duplicate live `client_id` is refused with
    /// [`CollabError::AdmissionConflict`] and changes nothing.
    pub async fn admit(
        &self,
        params: &ConnectParams,
        control: ControlSender,
    ) -> Result<Admission, CollabError> {
        let mut inner = self.inner.lock().await;

        let id = match inner.connections.admit(params, control) {
            Ok(id) => id,
            Err(e) => {
                self.total_refused.fetch_add(1, Ordering::Relaxed);
                log::warn!("Refused connection to {}: {e}", params.room);
                return Err(e);
            }
        };

        let joined = inner.rooms.join(&params.room, id);
        let (document, created) = inner.documents.get_or_create(&params.room);
        debug_assert_eq!(joined.created, created);

        let presence = inner.rooms.presence_frames(&params.room);
        let broadcast = joined.broadcast.clone();
        let frames = broadcast.subscribe();
        drop(inner);

        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{} ({}) joined {} ({} member{})",
            params.display_name,
            id,
            params.room,
            joined.members,
            if joined.members == 1 { "" } else { "s" }
        );

        Ok(Admission {
            id,
            room: params.room.clone(),
            document,
            broadcast,
            frames,
            presence,
            members: joined.members,
        })
    }

    /// Remove a connection. Idempotent: a second call returns `None`.
    pub async fn leave(&self, id: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.lock().await;
        let (departure, removal) = Self::leave_locked(&mut inner, id)?;
        drop(inner);

        if let Some(removal) = removal {
            removal.send();
        }
        Some(departure)
    }

    fn leave_locked(inner: &mut Inner, id: ConnectionId) -> Option<(Departure, Option<PendingRemoval>)> {
        let entry = inner.connections.remove(id)?;
        let room = entry.room;

        let outcome = inner.rooms.leave(&room, id);
        let remaining = outcome
            .as_ref()
            .map_or_else(|| inner.rooms.member_count(&room), |o| o.remaining);
        let mut removal = None;

        if remaining == 0 {
            inner.documents.destroy(&room);
            inner.rooms.remove(&room);
            log::info!("{} ({id}) left {room}; room removed (empty)", entry.display_name);
        } else {
            log::info!("{} ({id}) left {room} ({remaining} remaining)", entry.display_name);
            let released = outcome.map(|o| o.released_sessions).unwrap_or_default();
            if !released.is_empty() {
                if let Some(broadcast) = inner.rooms.broadcast(&room) {
                    removal = Some(PendingRemoval { broadcast, session_ids: released });
                }
            }
        }

        Some((
            Departure { room, remaining, room_removed: remaining == 0 },
            removal,
        ))
    }

    /// Re-arm liveness after a probe acknowledgement.
    pub async fn mark_alive(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.connections.mark_alive(id)
    }

    /// One liveness pass: terminate connections that missed the last probe,
    /// probe the rest.
    pub async fn heartbeat_tick(&self) -> HeartbeatReport {
        let mut inner = self.inner.lock().await;
        let sweep = inner.connections.liveness_sweep();

        let mut terminations = Vec::with_capacity(sweep.dead.len());
        let mut removals = Vec::new();
        for id in &sweep.dead {
            let control = inner.connections.get(*id).map(|e| e.control().clone());
            if let Some((departure, removal)) = Self::leave_locked(&mut inner, *id) {
                log::warn!("Terminated {id} in {}: missed liveness probe", departure.room);
                removals.extend(removal);
            }
            terminations.extend(control);
        }
        drop(inner);

        for control in &terminations {
            let _ = control.send(Control::Terminate);
        }
        for (_, control) in &sweep.probes {
            let _ = control.send(Control::Probe);
        }
        for removal in removals {
            removal.send();
        }

        self.total_terminated
            .fetch_add(sweep.dead.len() as u64, Ordering::Relaxed);
        HeartbeatReport {
            probed: sweep.probes.len(),
            terminated: sweep.dead.len(),
        }
    }

    /// Compact the documents of rooms that currently have members.
    pub async fn compaction_sweep(&self) -> usize {
        let inner = self.inner.lock().await;
        let rooms = &inner.rooms;
        let compacted = inner
            .documents
            .compact_where(|room| rooms.member_count(room) > 0);
        drop(inner);
        self.compactions.fetch_add(compacted as u64, Ordering::Relaxed);
        log::info!("Compaction sweep: {compacted} active document(s) compacted");
        compacted
    }

    /// Record a presence frame published by `id` and return the room's
    /// broadcast group for relaying it.
    pub async fn record_awareness(
        &self,
        id: ConnectionId,
        msg: &AwarenessMessage,
        frame: &[u8],
    ) -> Option<Arc<BroadcastGroup>> {
        let mut inner = self.inner.lock().await;
        let room = inner.connections.get(id)?.room.clone();
        match msg {
            AwarenessMessage::Update { session_id, .. } => {
                inner.rooms.record_presence(&room, id, *session_id, frame.to_vec());
            }
            AwarenessMessage::Remove { session_ids } => {
                inner.rooms.forget_presence(&room, session_ids);
            }
        }
        inner.rooms.broadcast(&room)
    }

    /// Cached presence frames of `room`, for resyncing a member that fell behind.
    pub async fn presence_frames(&self, room: &str) -> Vec<Vec<u8>> {
        self.inner.lock().await.rooms.presence_frames(room)
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.inner.lock().await.rooms.member_count(room)
    }

    pub async fn document_exists(&self, room: &str) -> bool {
        self.inner.lock().await.documents.contains(room)
    }

    pub async fn is_client_id_live(&self, client_id: &str) -> bool {
        self.inner.lock().await.connections.is_client_id_live(client_id)
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            connections: inner.connections.len(),
            rooms: inner.rooms.len(),
            documents: inner.documents.len(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_refused: self.total_refused.load(Ordering::Relaxed),
            total_terminated: self.total_terminated.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// Destroy every document, forget every room and tell every connection
    /// task to drop its socket. Returns how many connections were closed.
    pub async fn shutdown(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let destroyed = inner.documents.destroy_all();
        inner.rooms.clear();
        let connections = inner.connections.drain();
        drop(inner);

        for (_, entry) in &connections {
            let _ = entry.control().send(Control::Terminate);
        }
        log::info!(
            "Registry shut down: {destroyed} document(s) destroyed, {} connection(s) closed",
            connections.len()
        );
        connections.len()
    }
}
