//! Connection parameters and the binary sync frame.
//!
//! A client opens a WebSocket on a path that names the room and carries its
//! self-asserted identity in the query string:
//!
//! ```text
//! ws://host:5678/whiteboard-AB12CD?userId=Fox42&clientId=8812&persistentId=u-1
//!                └──── room ─────┘ └ display ┘ └ short-lived ┘ └─ durable ─┘
//! ```
//!
//! After the upgrade every binary message is one bincode-encoded
//! [`SyncMessage`]:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ msg_type │ payload                                      │
//! │ 1 byte   │ state vector / update / AwarenessMessage     │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Liveness uses WebSocket ping/pong control frames, not sync frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Room used when the request path is empty.
pub const DEFAULT_ROOM: &str = "default";

/// Display name used when the client does not assert one.
pub const ANONYMOUS: &str = "Anonymous";

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the receiver answers with a `SyncStep2` diff
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Presence relay (payload is an encoded `AwarenessMessage`)
    Awareness = 4,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self { msg_type: MessageType::SyncStep1, payload: state_vector }
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Self { msg_type: MessageType::SyncStep2, payload: diff }
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self { msg_type: MessageType::Update, payload: update }
    }

    /// Wrap an already-encoded awareness payload.
    pub fn awareness(encoded: Vec<u8>) -> Self {
        Self { msg_type: MessageType::Awareness, payload: encoded }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Parameters a client declares when opening its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Room name (first path segment).
    pub room: String,
    /// Self-asserted display name (`userId`).
    pub display_name: String,
    /// Short-lived connection id used for duplicate-tab detection (`clientId`).
    pub client_id: Option<String>,
    /// Durable participant id used for reconnect correlation (`persistentId`).
    pub durable_id: Option<String>,
}

impl ConnectParams {
    pub fn new(room: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            display_name: display_name.into(),
            client_id: None,
            durable_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_durable_id(mut self, durable_id: impl Into<String>) -> Self {
        self.durable_id = Some(durable_id.into());
        self
    }

    /// Parse the request path and query of an upgrade request.
    ///
    /// Missing pieces fall back the same way the browser client expects:
    /// empty path → [`DEFAULT_ROOM`], no `userId` → [`ANONYMOUS`], and an
    /// empty `clientId`/`persistentId` counts as absent.
    pub fn from_request_target(path: &str, query: Option<&str>) -> Self {
        let room = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .map(percent_decode)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOM.to_string());

        let mut params = Self::new(room, ANONYMOUS);
        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value);
            if value.is_empty() {
                continue;
            }
            match key {
                "userId" => params.display_name = value,
                "clientId" => params.client_id = Some(value),
                "persistentId" => params.durable_id = Some(value),
                _ => {}
            }
        }
        params
    }

    /// Render as `/<room>?userId=..&clientId=..&persistentId=..`.
    pub fn to_request_target(&self) -> String {
        let mut target = format!(
            "/{}?userId={}",
            percent_encode(&self.room),
            percent_encode(&self.display_name)
        );
        if let Some(client_id) = &self.client_id {
            target.push_str("&clientId=");
            target.push_str(&percent_encode(client_id));
        }
        if let Some(durable_id) = &self.durable_id {
            target.push_str("&persistentId=");
            target.push_str(&percent_encode(durable_id));
        }
        target
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(decoded) => {
                        out.push(decoded);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
