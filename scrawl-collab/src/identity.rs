//! Participant identity that survives reloads.
//!
//! Two storage scopes are involved:
//!
//! | Key                     | Scope   | Value                                  |
//! |-------------------------|---------|----------------------------------------|
//! | `whiteboard-user-id`    | durable | random UUID, minted once per browser   |
//! | `whiteboard-username`   | durable | last display name the user chose       |
//! | `whiteboard-room-data`  | durable | JSON [`RejoinSnapshot`]                |
//! | `whiteboard-session-id` | session | browsing-session marker (ms timestamp) |
//!
//! The session marker is what tells a reload (marker present) apart from a
//! new tab or a restarted browser (marker absent).
//!
//! Room codes and generated names live here too; they are the user-visible
//! half of a participant's identity.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::ANONYMOUS;
use crate::storage::{KeyValueStore, StoreError};

pub const DURABLE_ID_KEY: &str = "whiteboard-user-id";
pub const USERNAME_KEY: &str = "whiteboard-username";
pub const SESSION_MARKER_KEY: &str = "whiteboard-session-id";
pub const ROOM_DATA_KEY: &str = "whiteboard-room-data";

/// Unambiguous characters only (no `I`, `O`, `0`, `1`).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;
const ROOM_NAME_PREFIX: &str = "whiteboard-";

const ADJECTIVES: [&str; 20] = [
    "Swift", "Happy", "Clever", "Bright", "Agile", "Bold", "Brave", "Calm", "Cool", "Eager",
    "Fair", "Kind", "Lively", "Proud", "Smart", "Witty", "Zesty", "Keen", "Jolly", "Honest",
];

const ANIMALS: [&str; 20] = [
    "Panda", "Tiger", "Eagle", "Dolphin", "Fox", "Wolf", "Bear", "Hawk", "Lion", "Owl",
    "Panther", "Raven", "Shark", "Whale", "Zebra", "Dragon", "Phoenix", "Unicorn", "Griffin",
    "Wizard",
];

/// Local participant colors.
pub const USER_COLORS: [&str; 10] = [
    "#000000", "#1A1A1A", "#333333", "#4D4D4D", "#666666", "#808080", "#999999", "#B3B3B3",
    "#CCCCCC", "#E6E6E6",
];

// ───────────────────────────────────────────────────────────────────
// Room codes and names
// ───────────────────────────────────────────────────────────────────

pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Upper-case and strip whitespace from user input.
pub fn normalize_room_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
}

/// Looser check for codes typed by hand: any six upper-case letters or digits.
pub fn is_joinable_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// `"AB12CD"` → `"AB1 2CD"`.
pub fn format_room_code(code: &str) -> String {
    let upper: Vec<char> = normalize_room_code(code).chars().collect();
    upper
        .chunks(3)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Network room name for a room code.
pub fn room_name(code: &str) -> String {
    format!("{ROOM_NAME_PREFIX}{code}")
}

/// Room code back out of a network room name.
pub fn room_code_from_name(name: &str) -> Option<&str> {
    name.strip_prefix(ROOM_NAME_PREFIX)
}

/// `<Adjective><Animal><0..99>`, e.g. `SwiftOwl42`.
pub fn generate_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Swift");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Fox");
    format!("{adjective}{animal}{}", rng.gen_range(0..100))
}

pub fn pick_user_color() -> &'static str {
    USER_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_COLORS[0])
}

// ───────────────────────────────────────────────────────────────────
// Rejoin snapshot
// ───────────────────────────────────────────────────────────────────

/// What a reloaded tab needs to silently rejoin its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinSnapshot {
    pub room_code: String,
    #[serde(rename = "userName")]
    pub display_name: String,
    #[serde(rename = "persistentId")]
    pub durable_id: String,
    #[serde(rename = "sessionId", default)]
    pub browsing_session_id: String,
    #[serde(rename = "isRefresh", default)]
    pub is_reload: bool,
    #[serde(default)]
    pub is_creator: bool,
}

impl RejoinSnapshot {
    /// A snapshot is usable only with both a room code and a display name.
    pub fn is_valid(&self) -> bool {
        !self.room_code.trim().is_empty() && !self.display_name.trim().is_empty()
    }

    pub fn room_name(&self) -> String {
        room_name(&self.room_code)
    }

    /// Whether joining with this snapshot should start from an empty local cache.
    pub fn starts_fresh(&self) -> bool {
        self.is_creator && !self.is_reload
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Typed access to the identity keys.
#[derive(Clone)]
pub struct IdentityStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    /// The durable participant id, minted on first use.
    pub fn ensure_durable_id(&self) -> Result<String, StoreError> {
        if let Some(id) = self.durable.get(DURABLE_ID_KEY)?.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.durable.set(DURABLE_ID_KEY, &id)?;
        log::info!("Minted durable participant id {id}");
        Ok(id)
    }

    pub fn durable_id(&self) -> Result<Option<String>, StoreError> {
        self.durable.get(DURABLE_ID_KEY)
    }

    pub fn session_marker(&self) -> Result<Option<String>, StoreError> {
        Ok(self.session.get(SESSION_MARKER_KEY)?.filter(|m| !m.is_empty()))
    }

    /// Write a new browsing-session marker.
    pub fn begin_browsing_session(&self, now_ms: u64) -> Result<String, StoreError> {
        let marker = now_ms.to_string();
        self.session.set(SESSION_MARKER_KEY, &marker)?;
        Ok(marker)
    }

    /// The stored snapshot if it parses and is usable. Anything else is
    /// removed from storage.
    pub fn valid_snapshot(&self) -> Result<Option<RejoinSnapshot>, StoreError> {
        let Some(raw) = self.durable.get(ROOM_DATA_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<RejoinSnapshot>(&raw) {
            Ok(snapshot) if snapshot.is_valid() => Ok(Some(snapshot)),
            Ok(_) => {
                log::warn!("Discarding incomplete rejoin snapshot");
                self.clear_snapshot()?;
                Ok(None)
            }
            Err(e) => {
                log::warn!("Discarding unreadable rejoin snapshot: {e}");
                self.clear_snapshot()?;
                Ok(None)
            }
        }
    }

    pub fn save_snapshot(&self, snapshot: &RejoinSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.durable.set(ROOM_DATA_KEY, &json)
    }

    pub fn clear_snapshot(&self) -> Result<(), StoreError> {
        self.durable.remove(ROOM_DATA_KEY)
    }

    pub fn last_display_name(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .durable
            .get(USERNAME_KEY)?
            .filter(|name| !name.is_empty() && name != ANONYMOUS))
    }

    /// Persist a chosen display name. The anonymous placeholder is never stored.
    pub fn remember_display_name(&self, name: &str) -> Result<(), StoreError> {
        if name.trim().is_empty() || name == ANONYMOUS {
            return Ok(());
        }
        self.durable.set(USERNAME_KEY, name)
    }
}
