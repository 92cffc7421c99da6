//! Room documents: one replicated `yrs::Doc` per live room.
//!
//! The merge engine itself is opaque here. A [`DocumentHandle`] only exposes
//! what the session layer needs from it: apply an update, answer a state
//! vector with a diff, encode the full state, compact, and destroy.
//!
//! A handle may outlive its registry entry (a connection task can still hold
//! an `Arc` to it while a late frame is in flight). Once destroyed, every
//! operation on it fails with [`DocumentError::Destroyed`], so nothing can be
//! routed into a half-torn-down document.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("document for room {0} has been destroyed")]
    Destroyed(String),
    #[error("malformed update or state vector: {0}")]
    Decode(String),
    #[error("update rejected by engine: {0}")]
    Apply(String),
}

/// Handle to the replicated document of one room.
pub struct DocumentHandle {
    room: String,
    /// `None` once destroyed.
    doc: Mutex<Option<Doc>>,
    updates_applied: AtomicU64,
    compactions: AtomicU64,
}

impl DocumentHandle {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            doc: Mutex::new(Some(Doc::new())),
            updates_applied: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    fn with_doc<T>(&self, f: impl FnOnce(&Doc) -> Result<T, DocumentError>) -> Result<T, DocumentError> {
        let guard = self.doc.lock();
        match guard.as_ref() {
            Some(doc) => f(doc),
            None => Err(DocumentError::Destroyed(self.room.clone())),
        }
    }

    /// Merge a v1-encoded update into the document.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        self.with_doc(|doc| {
            let update = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
            Ok(())
        })?;
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Encoded state vector of the document.
    pub fn state_vector(&self) -> Result<Vec<u8>, DocumentError> {
        self.with_doc(|doc| Ok(doc.transact().state_vector().encode_v1()))
    }

    /// Everything the holder of `remote_state_vector` is missing.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        self.with_doc(|doc| {
            let sv = StateVector::decode_v1(remote_state_vector)
                .map_err(|e| DocumentError::Decode(e.to_string()))?;
            Ok(doc.transact().encode_diff_v1(&sv))
        })
    }

    /// Full document state as a single update.
    pub fn full_state(&self) -> Result<Vec<u8>, DocumentError> {
        self.with_doc(|doc| Ok(doc.transact().encode_state_as_update_v1(&StateVector::default())))
    }

    /// Compact the document's history by rebuilding it from its own snapshot.
    ///
    /// Tombstoned content is already garbage-collected into `GC` ranges by the
    /// engine; re-encoding merges those ranges and drops per-item bookkeeping.
    /// Returns the encoded size after compaction.
    pub fn compact(&self) -> Result<usize, DocumentError> {
        let mut guard = self.doc.lock();
        let doc = guard
            .as_ref()
            .ok_or_else(|| DocumentError::Destroyed(self.room.clone()))?;

        let snapshot = doc.transact().encode_state_as_update_v1(&StateVector::default());
        let rebuilt = Doc::new();
        {
            let update = Update::decode_v1(&snapshot).map_err(|e| DocumentError::Decode(e.to_string()))?;
            let mut txn = rebuilt.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        *guard = Some(rebuilt);
        self.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot.len())
    }

    /// Release the engine instance. Returns `false` if it was already gone.
    pub fn destroy(&self) -> bool {
        self.doc.lock().take().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.doc.lock().is_none()
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied.load(Ordering::Relaxed)
    }

    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }
}

/// Room name → document handle. At most one handle per room.
#[derive(Default)]
pub struct DocumentRegistry {
    docs: HashMap<String, Arc<DocumentHandle>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing handle for `room`, or a fresh one. The flag is `true` on creation.
    pub fn get_or_create(&mut self, room: &str) -> (Arc<DocumentHandle>, bool) {
        if let Some(doc) = self.docs.get(room) {
            return (doc.clone(), false);
        }
        let doc = Arc::new(DocumentHandle::new(room));
        self.docs.insert(room.to_string(), doc.clone());
        log::info!("Document for room {room} created");
        (doc, true)
    }

    pub fn contains(&self, room: &str) -> bool {
        self.docs.contains_key(room)
    }

    /// Destroy the engine instance, then drop the entry.
    pub fn destroy(&mut self, room: &str) -> bool {
        match self.docs.get(room) {
            Some(doc) => {
                doc.destroy();
                self.docs.remove(room);
                log::info!("Document for room {room} destroyed");
                true
            }
            None => false,
        }
    }

    /// Compact every document whose room passes `is_active`.
    ///
    /// Returns how many documents were compacted.
    pub fn compact_where(&self, is_active: impl Fn(&str) -> bool) -> usize {
        let mut compacted = 0;
        for (room, doc) in &self.docs {
            if !is_active(room) {
                continue;
            }
            match doc.compact() {
                Ok(size) => {
                    compacted += 1;
                    log::debug!("Compacted document for room {room} ({size} bytes)");
                }
                Err(e) => log::warn!("Compaction failed for room {room}: {e}"),
            }
        }
        compacted
    }

    /// Destroy every document. Returns how many were live.
    pub fn destroy_all(&mut self) -> usize {
        let count = self.docs.len();
        for (_, doc) in self.docs.drain() {
            doc.destroy();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
