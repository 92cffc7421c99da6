//! Ephemeral per-room presence: who is here, which tool they hold, where
//! their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! pointer move
//!       │
//!       ▼
//! PresenceChannel::update_cursor()   ── < 10ms since last send? ──► pending (coalesced)
//!       │                                                              │
//!       ▼                                                              ▼
//! AwarenessMessage::Update        ◄──────────── flush_pending_cursor() once due
//!       │
//!       ▼   (SyncMessage::Awareness, relayed by the server)
//! remote PresenceChannel::apply()
//!       │
//!       ▼
//! visible_cursors()  (5s render window, 20s discard window)
//! ```
//!
//! Each channel holds one entry per live session, its own included. A
//! reload produces a fresh session id for the same durable participant, so
//! the previous tab's entry lingers until [`PresenceChannel::reconcile`]
//! removes it, one settle delay after the new connection comes up.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::{ProtocolError, SyncMessage};

/// Short-lived presence identity, one per connection attempt.
pub type SessionId = u64;

/// Tool announced before the user picks one.
pub const DEFAULT_TOOL: &str = "select";

/// Render colors for remote cursors, chosen by session id.
pub const CURSOR_PALETTE: [&str; 8] = [
    "#FF5733", "#33FF57", "#3357FF", "#FF33A8", "#33FFF5", "#F5FF33", "#A833FF", "#FF8C33",
];

/// Wall-clock milliseconds; cursor timestamps travel between machines.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Fresh random session id (never zero).
pub fn new_session_id() -> SessionId {
    rand::thread_rng().gen_range(1..u64::MAX)
}

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Which fields identify a stale duplicate of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileKey {
    /// Same durable id and same display name. Two participants who share a
    /// durable id but were renamed between tabs are not merged; the name
    /// check is a weak proxy kept for compatibility with existing clients.
    #[default]
    DurableIdAndName,
    /// Same durable id, regardless of display name.
    DurableId,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Wait after connecting before reconciling.
    pub settle_delay: Duration,
    /// Minimum spacing between outgoing cursor updates.
    pub cursor_min_interval: Duration,
    /// Remote cursors older than this are hidden.
    pub cursor_render_window: Duration,
    /// Remote entries whose cursor is older than this are dropped.
    pub cursor_discard_window: Duration,
    pub reconcile_key: ReconcileKey,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            cursor_min_interval: Duration::from_millis(10),
            cursor_render_window: Duration::from_secs(5),
            cursor_discard_window: Duration::from_secs(20),
            reconcile_key: ReconcileKey::default(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    pub timestamp_ms: u64,
}

/// Published state of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceState {
    pub display_name: String,
    pub durable_id: Option<String>,
    pub color: String,
    pub active_tool: String,
    pub cursor: Option<Cursor>,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self {
            display_name: crate::protocol::ANONYMOUS.to_string(),
            durable_id: None,
            color: "#808080".to_string(),
            active_tool: DEFAULT_TOOL.to_string(),
            cursor: None,
        }
    }
}

impl PresenceState {
    pub fn new(display_name: impl Into<String>, durable_id: Option<String>, color: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            durable_id,
            color: color.into(),
            ..Self::default()
        }
    }
}

/// Presence traffic, carried as the payload of `SyncMessage::Awareness`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full state of one session. Higher `clock` wins.
    Update {
        session_id: SessionId,
        clock: u64,
        state: PresenceState,
    },
    /// These sessions are gone.
    Remove { session_ids: Vec<SessionId> },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Wrap into a sync frame.
    pub fn to_sync_message(&self) -> Result<SyncMessage, ProtocolError> {
        Ok(SyncMessage::awareness(self.encode()?))
    }
}

// ───────────────────────────────────────────────────────────────────
// Consumer views
// ───────────────────────────────────────────────────────────────────

/// A remote cursor ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub session_id: SessionId,
    pub display_name: String,
    pub color: &'static str,
    pub x: f64,
    pub y: f64,
    pub timestamp_ms: u64,
    pub active_tool: String,
}

/// One row of the participant list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub session_id: SessionId,
    pub display_name: String,
    pub active_tool: String,
    pub is_local: bool,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    pub removed: Vec<SessionId>,
    /// Removal to publish; `None` when nothing was stale.
    pub message: Option<AwarenessMessage>,
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    state: PresenceState,
}

/// Presence map of one room as seen by one client.
pub struct PresenceChannel {
    config: PresenceConfig,
    local_session: SessionId,
    clock: u64,
    entries: HashMap<SessionId, Entry>,
    last_cursor_sent_ms: Option<u64>,
    pending_cursor: Option<(f64, f64)>,
}

impl PresenceChannel {
    pub fn new(local_session: SessionId, local_state: PresenceState, config: PresenceConfig) -> Self {
        let mut entries = HashMap::new();
        entries.insert(local_session, Entry { clock: 0, state: local_state });
        Self {
            config,
            local_session,
            clock: 0,
            entries,
            last_cursor_sent_ms: None,
            pending_cursor: None,
        }
    }

    pub fn local_session(&self) -> SessionId {
        self.local_session
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn local_state(&self) -> Option<&PresenceState> {
        self.entries.get(&self.local_session).map(|e| &e.state)
    }

    fn local_mut(&mut self) -> &mut PresenceState {
        let clock = self.clock;
        &mut self
            .entries
            .entry(self.local_session)
            .or_insert_with(|| Entry { clock, state: PresenceState::default() })
            .state
    }

    /// Bump the local clock and describe the local entry.
    fn publish_local(&mut self) -> AwarenessMessage {
        self.clock += 1;
        let clock = self.clock;
        let state = {
            let local = self
                .entries
                .entry(self.local_session)
                .or_insert_with(|| Entry { clock, state: PresenceState::default() });
            local.clock = clock;
            local.state.clone()
        };
        AwarenessMessage::Update {
            session_id: self.local_session,
            clock,
            state,
        }
    }

    /// Full local state, for the initial announcement after connecting.
    pub fn announce(&mut self) -> AwarenessMessage {
        self.publish_local()
    }

    /// Record a pointer position. Returns the update to send, or `None` if
    /// the previous send was too recent; the latest suppressed position is
    /// kept for [`flush_pending_cursor`](Self::flush_pending_cursor).
    pub fn update_cursor(&mut self, x: f64, y: f64, now_ms: u64) -> Option<AwarenessMessage> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if !self.cursor_due(now_ms) {
            self.pending_cursor = Some((x, y));
            return None;
        }
        Some(self.send_cursor(x, y, now_ms))
    }

    /// Emit the coalesced cursor position once the minimum interval has passed.
    pub fn flush_pending_cursor(&mut self, now_ms: u64) -> Option<AwarenessMessage> {
        if !self.cursor_due(now_ms) {
            return None;
        }
        let (x, y) = self.pending_cursor?;
        Some(self.send_cursor(x, y, now_ms))
    }

    pub fn has_pending_cursor(&self) -> bool {
        self.pending_cursor.is_some()
    }

    fn cursor_due(&self, now_ms: u64) -> bool {
        let min = self.config.cursor_min_interval.as_millis() as u64;
        match self.last_cursor_sent_ms {
            Some(last) => now_ms.saturating_sub(last) >= min,
            None => true,
        }
    }

    fn send_cursor(&mut self, x: f64, y: f64, now_ms: u64) -> AwarenessMessage {
        self.pending_cursor = None;
        self.last_cursor_sent_ms = Some(now_ms);
        self.local_mut().cursor = Some(Cursor { x, y, timestamp_ms: now_ms });
        log::trace!("cursor ({x}, {y}) at {now_ms}");
        self.publish_local()
    }

    /// Change the announced tool. Sent immediately, never throttled.
    pub fn set_active_tool(&mut self, tool: impl Into<String>) -> AwarenessMessage {
        self.local_mut().active_tool = tool.into();
        self.publish_local()
    }

    /// Merge remote presence traffic. Returns the session ids whose entry
    /// changed.
    pub fn apply(&mut self, msg: &AwarenessMessage) -> Vec<SessionId> {
        match msg {
            AwarenessMessage::Update { session_id, clock, state } => {
                if *session_id == self.local_session {
                    return Vec::new();
                }
                if let Some(existing) = self.entries.get(session_id) {
                    if existing.clock >= *clock {
                        return Vec::new();
                    }
                }
                self.entries.insert(*session_id, Entry { clock: *clock, state: state.clone() });
                vec![*session_id]
            }
            AwarenessMessage::Remove { session_ids } => session_ids
                .iter()
                .filter(|id| **id != self.local_session)
                .filter(|id| self.entries.remove(*id).is_some())
                .copied()
                .collect(),
        }
    }

    /// Remove stale entries left over from earlier connections of the local
    /// participant.
    ///
    /// An entry is stale when it is not the local session and its durable id
    /// (and, with [`ReconcileKey::DurableIdAndName`], its display name)
    /// matches the local entry.
    pub fn reconcile(&mut self) -> Reconciliation {
        let Some(local) = self.local_state().cloned() else {
            return Reconciliation::default();
        };
        let Some(durable_id) = local.durable_id.clone() else {
            return Reconciliation::default();
        };
        let key = self.config.reconcile_key;

        let mut removed: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(session, _)| **session != self.local_session)
            .filter(|(_, entry)| entry.state.durable_id.as_deref() == Some(durable_id.as_str()))
            .filter(|(_, entry)| match key {
                ReconcileKey::DurableIdAndName => entry.state.display_name == local.display_name,
                ReconcileKey::DurableId => true,
            })
            .map(|(session, _)| *session)
            .collect();
        removed.sort_unstable();

        if key == ReconcileKey::DurableIdAndName {
            let renamed = self
                .entries
                .iter()
                .filter(|(session, _)| **session != self.local_session)
                .filter(|(_, entry)| entry.state.durable_id.as_deref() == Some(durable_id.as_str()))
                .filter(|(_, entry)| entry.state.display_name != local.display_name)
                .count();
            if renamed > 0 {
                log::debug!(
                    "Kept {renamed} entries sharing durable id {durable_id} under another name"
                );
            }
        }

        if removed.is_empty() {
            return Reconciliation::default();
        }
        for session in &removed {
            self.entries.remove(session);
        }
        log::debug!(
            "Reconciled stale presence entries {:?} for {}",
            removed,
            local.display_name
        );
        Reconciliation {
            message: Some(AwarenessMessage::Remove { session_ids: removed.clone() }),
            removed,
        }
    }

    /// Remote cursors recent enough to draw.
    pub fn visible_cursors(&self, now_ms: u64) -> Vec<RemoteCursor> {
        let window = self.config.cursor_render_window.as_millis() as u64;
        let mut cursors: Vec<RemoteCursor> = self
            .entries
            .iter()
            .filter(|(session, _)| **session != self.local_session)
            .filter_map(|(session, entry)| {
                let cursor = entry.state.cursor?;
                let fresh = now_ms.saturating_sub(cursor.timestamp_ms) < window;
                (fresh && cursor.x.is_finite() && cursor.y.is_finite()).then(|| RemoteCursor {
                    session_id: *session,
                    display_name: entry.state.display_name.clone(),
                    color: cursor_color(*session),
                    x: cursor.x,
                    y: cursor.y,
                    timestamp_ms: cursor.timestamp_ms,
                    active_tool: entry.state.active_tool.clone(),
                })
            })
            .collect();
        cursors.sort_by_key(|c| c.session_id);
        cursors
    }

    /// Drop remote entries whose cursor is older than the discard window.
    ///
    /// Entries that never published a cursor are left for an explicit
    /// removal.
    pub fn purge_expired(&mut self, now_ms: u64) -> Vec<SessionId> {
        let window = self.config.cursor_discard_window.as_millis() as u64;
        let local = self.local_session;
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(session, _)| **session != local)
            .filter(|(_, entry)| {
                entry
                    .state
                    .cursor
                    .is_some_and(|c| now_ms.saturating_sub(c.timestamp_ms) >= window)
            })
            .map(|(session, _)| *session)
            .collect();
        for session in &expired {
            self.entries.remove(session);
        }
        expired
    }

    pub fn participants(&self) -> Vec<Participant> {
        let mut rows: Vec<Participant> = self
            .entries
            .iter()
            .map(|(session, entry)| Participant {
                session_id: *session,
                display_name: entry.state.display_name.clone(),
                active_tool: entry.state.active_tool.clone(),
                is_local: *session == self.local_session,
            })
            .collect();
        rows.sort_by_key(|p| p.session_id);
        rows
    }

    pub fn get(&self, session: SessionId) -> Option<&PresenceState> {
        self.entries.get(&session).map(|e| &e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Render color for a remote session.
pub fn cursor_color(session: SessionId) -> &'static str {
    CURSOR_PALETTE[(session % CURSOR_PALETTE.len() as u64) as usize]
}
