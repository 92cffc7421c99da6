//! Per-room fan-out to every member connection.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind sees `Lagged` and skips ahead.
//! Frames carry their origin so a connection never echoes its own traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::connection::ConnectionId;
use crate::protocol::{ProtocolError, SyncMessage};

/// One pre-encoded frame queued for a room.
#[derive(Debug)]
pub struct Frame {
    /// Connection that produced the frame; `None` for server-originated frames.
    pub origin: Option<ConnectionId>,
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Whether `conn` should receive this frame.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.origin != Some(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_unrouted: u64,
    pub subscribers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    capacity: usize,
    frames_sent: AtomicU64,
    /// Frames sent while nobody was subscribed.
    frames_unrouted: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_unrouted: AtomicU64::new(0),
        }
    }

    /// Subscribe a member to this room's frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    /// Encode and queue `msg` for every subscriber except `origin`.
    ///
    /// Returns the number of receivers that were handed the frame
    /// (the origin's own receiver included; filtering happens on receive).
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(origin, msg.encode()?))
    }

    /// Queue pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Option<ConnectionId>, bytes: Vec<u8>) -> usize {
        let frame = Arc::new(Frame { origin, bytes });
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(frame) {
            Ok(count) => count,
            Err(_) => {
                self.frames_unrouted.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Lock-free statistics snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_unrouted: self.frames_unrouted.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
