//! State store.
//!
//! A key-value store addressed by workflow id (checkpoints use
//! `{workflow_id}:{checkpoint_id}` sibling keys). The default backend is
//! file-based with atomic rename on save, so a crash mid-write never
//! corrupts a previously saved blob.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Blob storage for serialized execution state.
pub trait StateStore: Send + Sync {
    fn save(&self, id: &str, blob: &[u8]) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<Vec<u8>>>;
    fn list(&self) -> Result<Vec<String>>;
    fn delete(&self, id: &str) -> Result<bool>;
}

/// File-backed store: one JSON blob per key under a directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    // Keys may contain ':' (checkpoint siblings); encode it for filenames.
    // Ids themselves must not contain '@'.
    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id.replace(':', "@")))
    }

    fn id_from(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(".json")
            .map(|stem| stem.replace('@', ":"))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, id: &str, blob: &[u8]) -> Result<()> {
        let target = self.path_for(id);
        let tmp = self.dir.join(format!(
            ".{}.tmp",
            target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("blob")
        ));
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &target)?;
        debug!(id, bytes = blob.len(), "state saved");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(id)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with('.') {
                    continue;
                }
                if let Some(id) = Self::id_from(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, id: &str, blob: &[u8]) -> Result<()> {
        self.blobs.lock().insert(id.to_string(), blob.to_vec());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.blobs.lock().keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.lock().remove(id).is_some())
    }
}
