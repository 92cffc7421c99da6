//! Client-side durable state.
//!
//! ```text
//! ┌────────────────┐  small string pairs   ┌─────────────────────────┐
//! │ IdentityStore  │ ────────────────────► │ KeyValueStore           │
//! │                │                       │  durable  (per browser) │
//! │                │                       │  session  (per tab)     │
//! └────────────────┘                       └─────────────────────────┘
//! ┌────────────────┐  full doc state (LZ4) ┌─────────────────────────┐
//! │ SyncClient     │ ────────────────────► │ DocCache (per room)     │
//! └────────────────┘                       └─────────────────────────┘
//! ```
//!
//! Both seams come with an in-memory backend for tests and a file backend
//! for the native client.

pub mod cache;
pub mod kv;

pub use cache::{DocCache, FileDocCache, MemoryDocCache};
pub use kv::{FileStore, KeyValueStore, MemoryStore};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// Stored bytes could not be parsed
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// LZ4 round-trip failed
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// Write `bytes` next to `path` and move it into place.
pub(crate) fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
