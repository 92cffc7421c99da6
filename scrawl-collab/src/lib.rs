//! # scrawl-collab: session and presence layer for a shared whiteboard
//!
//! Maps WebSocket connections to rooms and rooms to replicated documents,
//! reaps dead peers, and keeps presence free of ghost participants across
//! reloads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   WebSocket    ┌──────────────────────────┐
//! │ SessionOrchestrator  │                │ SyncServer               │
//! │  └─ SyncClient       │ ◄────────────► │  └─ SessionRegistry      │
//! │      ├─ Yrs Doc      │  Binary Proto  │      ├─ ConnectionRegistry│
//! │      ├─ Presence     │                │      ├─ RoomRegistry      │
//! │      └─ DocCache     │                │      └─ DocumentRegistry  │
//! └──────────┬───────────┘                └─────────────┬────────────┘
//!            │                                          │
//!            ▼                                          ▼
//!   IdentityStore (durable +                 heartbeat sweep (30 s)
//!   session key-value storage)               compaction sweep (30 min)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol and connection parameters
//! - [`broadcast`]: Per-room fan-out
//! - [`connection`], [`room`], [`document`]: The three server registries
//! - [`registry`]: Their single owner: admit, leave, heartbeat, compaction
//! - [`server`]: WebSocket sync server
//! - [`presence`]: Presence entries, cursor throttling, reconciliation
//! - [`identity`]: Durable identity, rejoin snapshot, room codes
//! - [`client`]: WebSocket sync client (one provider per room)
//! - [`session`]: Fresh start / rejoin state machine

pub mod protocol;
pub mod error;
pub mod broadcast;
pub mod connection;
pub mod room;
pub mod document;
pub mod registry;
pub mod server;
pub mod presence;
pub mod storage;
pub mod identity;
pub mod client;
pub mod session;

// Re-exports for convenience
pub use protocol::{ConnectParams, MessageType, ProtocolError, SyncMessage};
pub use error::CollabError;
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use connection::{ConnectionId, ConnectionRegistry, Control};
pub use room::RoomRegistry;
pub use document::{DocumentError, DocumentHandle, DocumentRegistry};
pub use registry::{Admission, Departure, HeartbeatReport, RegistryStats, SessionRegistry};
pub use server::{ServerConfig, SyncServer};
pub use presence::{
    AwarenessMessage, Participant, PresenceChannel, PresenceConfig, PresenceState,
    ReconcileKey, RemoteCursor, SessionId,
};
pub use storage::{
    DocCache, FileDocCache, FileStore, KeyValueStore, MemoryDocCache, MemoryStore, StoreError,
};
pub use identity::{IdentityStore, RejoinSnapshot};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncClientFactory, SyncEvent};
pub use session::{
    AddressBar, MemoryAddressBar, Provider, ProviderFactory, ProviderSpec, RuntimeHandle,
    SessionOrchestrator, SessionState,
};
