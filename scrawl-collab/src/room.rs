//! Room membership and the per-room presence cache.
//!
//! A room exists only while it has members. The registry never deletes an
//! emptied room on its own: the caller first destroys the paired document
//! and then calls [`RoomRegistry::remove`], so the room stays visible until
//! its document is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::broadcast::BroadcastGroup;
use crate::connection::ConnectionId;

/// Last presence frame a member published for one of its session ids.
#[derive(Debug, Clone)]
struct CachedPresence {
    owner: ConnectionId,
    frame: Vec<u8>,
}

/// A live room.
pub struct Room {
    members: HashSet<ConnectionId>,
    broadcast: Arc<BroadcastGroup>,
    presence: HashMap<u64, CachedPresence>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            members: HashSet::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            presence: HashMap::new(),
        }
    }

    pub fn members(&self) -> &HashSet<ConnectionId> {
        &self.members
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

pub struct JoinOutcome {
    pub created: bool,
    pub members: usize,
    pub broadcast: Arc<BroadcastGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub remaining: usize,
    /// Presence session ids the departing member owned.
    pub released_sessions: Vec<u64>,
}

impl LeaveOutcome {
    pub fn emptied(&self) -> bool {
        self.remaining == 0
    }
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            broadcast_capacity,
        }
    }

    /// Add `conn` to `room`, creating the room if absent.
    pub fn join(&mut self, room: &str, conn: ConnectionId) -> JoinOutcome {
        let created = !self.rooms.contains_key(room);
        let capacity = self.broadcast_capacity;
        let entry = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(capacity));
        entry.members.insert(conn);
        JoinOutcome {
            created,
            members: entry.members.len(),
            broadcast: entry.broadcast.clone(),
        }
    }

    /// Remove `conn` from `room` and drop its cached presence.
    ///
    /// Returns `None` if the room or member is unknown.
    pub fn leave(&mut self, room: &str, conn: ConnectionId) -> Option<LeaveOutcome> {
        let entry = self.rooms.get_mut(room)?;
        if !entry.members.remove(&conn) {
            return None;
        }
        let released_sessions: Vec<u64> = entry
            .presence
            .iter()
            .filter(|(_, cached)| cached.owner == conn)
            .map(|(session, _)| *session)
            .collect();
        for session in &released_sessions {
            entry.presence.remove(session);
        }
        Some(LeaveOutcome {
            remaining: entry.members.len(),
            released_sessions,
        })
    }

    /// Delete a room entry. Refused while it still has members.
    pub fn remove(&mut self, room: &str) -> Option<Room> {
        if self.member_count(room) > 0 {
            return None;
        }
        self.rooms.remove(room)
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.members.len())
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn get(&self, room: &str) -> Option<&Room> {
        self.rooms.get(room)
    }

    pub fn broadcast(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.get(room).map(|r| r.broadcast.clone())
    }

    /// Remember the latest presence frame for `session_id`, owned by `conn`.
    pub fn record_presence(&mut self, room: &str, conn: ConnectionId, session_id: u64, frame: Vec<u8>) {
        if let Some(entry) = self.rooms.get_mut(room) {
            entry.presence.insert(session_id, CachedPresence { owner: conn, frame });
        }
    }

    /// Drop cached presence for the given sessions, whoever owns them.
    pub fn forget_presence(&mut self, room: &str, session_ids: &[u64]) {
        if let Some(entry) = self.rooms.get_mut(room) {
            for session in session_ids {
                entry.presence.remove(session);
            }
        }
    }

    /// Cached presence frames of `room`, for replay to a joining member.
    pub fn presence_frames(&self, room: &str) -> Vec<Vec<u8>> {
        self.rooms
            .get(room)
            .map(|r| r.presence.values().map(|c| c.frame.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::from_raw(n)
    }

    #[test]
    fn test_first_join_creates_room() {
        let mut rooms = RoomRegistry::new(16);
        let first = rooms.join("r", conn(1));
        assert!(first.created);
        assert_eq!(first.members, 1);
        let second = rooms.join("r", conn(2));
        assert!(!second.created);
        assert_eq!(second.members, 2);
        assert!(Arc::ptr_eq(&first.broadcast, &second.broadcast));
        assert_eq!(rooms.member_count("r"), 2);
    }

    #[test]
    fn test_leave_reports_remaining() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("r", conn(1));
        rooms.join("r", conn(2));

        let outcome = rooms.leave("r", conn(1)).unwrap();
        assert_eq!(outcome.remaining, 1);
        assert!(!outcome.emptied());

        let outcome = rooms.leave("r", conn(2)).unwrap();
        assert!(outcome.emptied());
        // Still visible until explicitly removed.
        assert!(rooms.contains("r"));
        assert!(rooms.remove("r").is_some());
        assert!(!rooms.contains("r"));
    }

    #[test]
    fn test_leave_unknown_member() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("r", conn(1));
        assert!(rooms.leave("r", conn(2)).is_none());
        assert!(rooms.leave("nope", conn(1)).is_none());
    }

    #[test]
    fn test_remove_refused_while_occupied() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("r", conn(1));
        assert!(rooms.remove("r").is_none());
        assert!(rooms.contains("r"));
    }

    #[test]
    fn test_presence_released_on_leave() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("r", conn(1));
        rooms.join("r", conn(2));
        rooms.record_presence("r", conn(1), 100, vec![1]);
        rooms.record_presence("r", conn(1), 101, vec![2]);
        rooms.record_presence("r", conn(2), 200, vec![3]);

        let mut released = rooms.leave("r", conn(1)).unwrap().released_sessions;
        released.sort();
        assert_eq!(released, vec![100, 101]);
        assert_eq!(rooms.presence_frames("r"), vec![vec![3]]);
    }

    #[test]
    fn test_forget_presence_any_owner() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("r", conn(1));
        rooms.record_presence("r", conn(1), 100, vec![1]);
        rooms.forget_presence("r", &[100]);
        assert!(rooms.presence_frames("r").is_empty());
    }

    #[test]
    fn test_rooms_share_nothing() {
        let mut rooms = RoomRegistry::new(16);
        rooms.join("a", conn(1));
        rooms.join("b", conn(2));
        let a = rooms.broadcast("a").unwrap();
        let b = rooms.broadcast("b").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(rooms.len(), 2);
    }
}
