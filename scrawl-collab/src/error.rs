//! Error taxonomy shared by the server and client halves.
//!
//! Everything here is contained to one connection or one room. The only
//! failure that reaches the user as a blocking state is [`CollabError::Setup`].

use thiserror::Error;

use crate::document::DocumentError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// A second live connection declared a short-lived id that is already
    /// registered. The new connection is refused; the existing one is untouched.
    #[error("duplicate live connection id {client_id}")]
    AdmissionConflict { client_id: String },

    /// The underlying connection failed or dropped. Handled exactly like a
    /// graceful close.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A hand-entered room code that can never name a room.
    #[error("invalid room code {0:?}")]
    InvalidRoomCode(String),

    /// The collaboration subsystem could not be brought up.
    #[error("collaboration setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

impl CollabError {
    /// Whether this error should put the client into its blocking error state.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, CollabError::Setup(_))
    }
}
