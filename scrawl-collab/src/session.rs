//! Reconnect and rejoin orchestration on the client.
//!
//! ```text
//!                    ┌──────────────┐
//!                    │ Bootstrapping│
//!                    └──────┬───────┘
//!          marker absent    │    marker + valid snapshot
//!        ┌──────────────────┴──────────────────┐
//!        ▼                                     ▼
//!  ┌───────────┐   join / create        ┌──────────────┐
//!  │ FreshStart│ ─────────────┐         │ RejoinPending│
//!  └───────────┘              │         └──────┬───────┘
//!        ▲                    ▼                │ resume
//!        │ leave        ┌──────────┐           │
//!        └───────────── │  Active  │ ◄─────────┘
//!                       └──────────┘
//! ```
//!
//! The orchestrator owns at most one provider. Any transition that needs a
//! new provider shuts the old one down first, so two providers for the same
//! durable identity never run side by side.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CollabError;
use crate::identity::{
    generate_display_name, generate_room_code, is_joinable_room_code, normalize_room_code,
    pick_user_color, IdentityStore, RejoinSnapshot,
};
use crate::storage::StoreError;

/// What a provider needs to join one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Network room name (`whiteboard-<CODE>`)
    pub room: String,
    pub display_name: String,
    pub durable_id: String,
    pub color: String,
    /// Start from an empty local cache (room creation only)
    pub clear_local_cache: bool,
}

impl ProviderSpec {
    pub fn from_snapshot(snapshot: &RejoinSnapshot, color: &str) -> Self {
        Self {
            room: snapshot.room_name(),
            display_name: snapshot.display_name.clone(),
            durable_id: snapshot.durable_id.clone(),
            color: color.to_string(),
            clear_local_cache: snapshot.starts_fresh(),
        }
    }
}

/// A network + storage provider bound to one room.
#[async_trait]
pub trait Provider: Send {
    fn room(&self) -> &str;

    /// Stop every timer, task and subscription the provider owns.
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait ProviderFactory: Send + Sync {
    type Provider: Provider;

    async fn create(&self, spec: ProviderSpec) -> Result<Self::Provider, CollabError>;
}

/// The user-visible address carrying the room code.
pub trait AddressBar: Send + Sync {
    fn room_code(&self) -> Option<String>;
    fn set_room_code(&self, code: &str);
    fn clear_room_code(&self);
}

/// Hook that restarts the client runtime after leaving a room.
pub trait RuntimeHandle: Send + Sync {
    fn restart(&self);
}

/// In-memory address bar.
#[derive(Debug, Default)]
pub struct MemoryAddressBar {
    code: Mutex<Option<String>>,
}

impl MemoryAddressBar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_room_code(code: impl Into<String>) -> Self {
        Self { code: Mutex::new(Some(code.into())) }
    }
}

impl AddressBar for MemoryAddressBar {
    fn room_code(&self) -> Option<String> {
        self.code.lock().clone()
    }

    fn set_room_code(&self, code: &str) {
        *self.code.lock() = Some(code.to_string());
    }

    fn clear_room_code(&self) {
        *self.code.lock() = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Bootstrapping,
    /// The user has to pick a room; the join form may be prefilled.
    FreshStart { prefill_room_code: Option<String> },
    /// A reload of an existing tab; [`SessionOrchestrator::resume`] rejoins.
    RejoinPending(RejoinSnapshot),
    Active(RejoinSnapshot),
    /// Blocking error state. Nothing collaborative is attempted from here.
    Failed(String),
}

fn setup_failure(e: StoreError) -> CollabError {
    CollabError::Setup(format!("identity storage unavailable: {e}"))
}

pub struct SessionOrchestrator<F: ProviderFactory, A, R> {
    identity: IdentityStore,
    factory: F,
    address: A,
    runtime: R,
    color: String,
    state: SessionState,
    provider: Option<F::Provider>,
}

impl<F, A, R> SessionOrchestrator<F, A, R>
where
    F: ProviderFactory,
    A: AddressBar,
    R: RuntimeHandle,
{
    pub fn new(identity: IdentityStore, factory: F, address: A, runtime: R) -> Self {
        Self {
            identity,
            factory,
            address,
            runtime,
            color: pick_user_color().to_string(),
            state: SessionState::Bootstrapping,
            provider: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn provider(&self) -> Option<&F::Provider> {
        self.provider.as_ref()
    }

    pub fn provider_mut(&mut self) -> Option<&mut F::Provider> {
        self.provider.as_mut()
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn address(&self) -> &A {
        &self.address
    }

    /// Name to prefill the join form with.
    pub fn suggested_display_name(&self) -> String {
        match self.identity.last_display_name() {
            Ok(Some(name)) => name,
            _ => generate_display_name(),
        }
    }

    /// Decide between a fresh start and a silent rejoin.
    pub fn bootstrap(&mut self, now_ms: u64) -> Result<&SessionState, CollabError> {
        match self.decide(now_ms) {
            Ok(state) => self.state = state,
            Err(e) => {
                log::error!("Session bootstrap failed: {e}");
                self.state = SessionState::Failed(e.to_string());
                return Err(e);
            }
        }
        Ok(&self.state)
    }

    fn decide(&self, now_ms: u64) -> Result<SessionState, CollabError> {
        let durable_id = self.identity.ensure_durable_id().map_err(setup_failure)?;
        let prefill_room_code = self
            .address
            .room_code()
            .map(|code| normalize_room_code(&code))
            .filter(|code| is_joinable_room_code(code));

        let Some(marker) = self.identity.session_marker().map_err(setup_failure)? else {
            self.identity.clear_snapshot().map_err(setup_failure)?;
            self.identity
                .begin_browsing_session(now_ms)
                .map_err(setup_failure)?;
            log::info!("New browsing session; any previous room is forgotten");
            return Ok(SessionState::FreshStart { prefill_room_code });
        };

        match self.identity.valid_snapshot().map_err(setup_failure)? {
            Some(mut snapshot) => {
                log::info!(
                    "Reload detected, rejoining {} as {}",
                    snapshot.room_code,
                    snapshot.display_name
                );
                snapshot.durable_id = durable_id;
                snapshot.browsing_session_id = marker;
                snapshot.is_reload = true;
                Ok(SessionState::RejoinPending(snapshot))
            }
            None => Ok(SessionState::FreshStart { prefill_room_code }),
        }
    }

    /// Re-establish the room of a reloaded tab.
    pub async fn resume(&mut self) -> Result<(), CollabError> {
        let SessionState::RejoinPending(snapshot) = &self.state else {
            return Ok(());
        };
        let snapshot = snapshot.clone();
        self.address.set_room_code(&snapshot.room_code);
        self.establish(snapshot).await
    }

    /// Create a room with a freshly minted code. Returns the code.
    pub async fn create_room(&mut self, display_name: &str) -> Result<String, CollabError> {
        let code = generate_room_code();
        self.join(&code, display_name, true).await?;
        Ok(code)
    }

    /// Join (or create) `room_code` as `display_name`.
    ///
    /// An empty display name gets a generated one. Switching rooms from
    /// `Active` tears the current provider down first.
    pub async fn join(
        &mut self,
        room_code: &str,
        display_name: &str,
        is_creator: bool,
    ) -> Result<(), CollabError> {
        let room_code = normalize_room_code(room_code);
        if !is_joinable_room_code(&room_code) {
            return Err(CollabError::InvalidRoomCode(room_code));
        }
        let display_name = match display_name.trim() {
            "" => generate_display_name(),
            name => name.to_string(),
        };

        let snapshot = RejoinSnapshot {
            room_code,
            display_name,
            durable_id: self.identity.ensure_durable_id().map_err(setup_failure)?,
            browsing_session_id: self
                .identity
                .session_marker()
                .map_err(setup_failure)?
                .unwrap_or_default(),
            is_reload: false,
            is_creator,
        };
        self.identity.save_snapshot(&snapshot)?;
        self.identity.remember_display_name(&snapshot.display_name)?;
        self.address.set_room_code(&snapshot.room_code);
        self.establish(snapshot).await
    }

    /// Leave the room: forget it and restart the runtime.
    pub async fn leave(&mut self) -> Result<(), CollabError> {
        self.teardown().await;
        self.identity.clear_snapshot()?;
        self.address.clear_room_code();
        self.runtime.restart();
        self.state = SessionState::FreshStart { prefill_room_code: None };
        log::info!("Left room; runtime restarted");
        Ok(())
    }

    /// Shut the provider down without forgetting the room.
    pub async fn teardown(&mut self) {
        if let Some(mut provider) = self.provider.take() {
            log::debug!("Tearing down provider for {}", provider.room());
            provider.shutdown().await;
        }
    }

    async fn establish(&mut self, snapshot: RejoinSnapshot) -> Result<(), CollabError> {
        self.teardown().await;

        let spec = ProviderSpec::from_snapshot(&snapshot, &self.color);
        match self.factory.create(spec).await {
            Ok(provider) => {
                log::info!("Session active in {}", provider.room());
                self.provider = Some(provider);
                self.state = SessionState::Active(snapshot);
                Ok(())
            }
            Err(e) if e.is_fatal_to_session() => {
                log::error!("Collaboration setup failed: {e}");
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
            Err(e) => {
                // The snapshot is persisted; resume() retries.
                log::warn!("Could not connect to {}: {e}", snapshot.room_code);
                self.state = SessionState::RejoinPending(snapshot);
                Err(e)
            }
        }
    }
}
