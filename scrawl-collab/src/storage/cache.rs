//! Local document cache, keyed by room.
//!
//! Holds the last known full state of a room's document so a reloaded
//! client can render before the network sync completes. The file backend
//! stores one LZ4 block per room.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{write_atomic, StoreError};

pub trait DocCache: Send + Sync {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, room: &str, state: &[u8]) -> Result<(), StoreError>;
    fn clear(&self, room: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDocCache {
    rooms: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDocCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.read().contains_key(room)
    }
}

impl DocCache for MemoryDocCache {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.rooms.read().get(room).cloned())
    }

    fn save(&self, room: &str, state: &[u8]) -> Result<(), StoreError> {
        self.rooms.write().insert(room.to_string(), state.to_vec());
        Ok(())
    }

    fn clear(&self, room: &str) -> Result<(), StoreError> {
        self.rooms.write().remove(room);
        Ok(())
    }
}

/// One compressed file per room under `dir`.
#[derive(Debug, Clone)]
pub struct FileDocCache {
    dir: PathBuf,
}

impl FileDocCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, room: &str) -> PathBuf {
        let name: String = room
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.ydoc.lz4"))
    }
}

impl DocCache for FileDocCache {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let compressed = match std::fs::read(self.path_for(room)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        lz4_flex::decompress_size_prepended(&compressed)
            .map(Some)
            .map_err(|e| StoreError::CompressionError(e.to_string()))
    }

    fn save(&self, room: &str, state: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(state);
        write_atomic(&self.path_for(room), &compressed)
    }

    fn clear(&self, room: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(room)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
