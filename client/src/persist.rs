//! Durable storage of the local store as a JSON snapshot file.

use crate::error::{Result, SyncError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tillsync_engine::{LocalStore, Schema, StoreSnapshot};

/// A snapshot file written atomically (temp file + rename).
///
/// Clones share the last written generation, so saves through any clone
/// are serialized and never replace a newer snapshot with an older one.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    written: Arc<Mutex<u64>>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot, or `None` if the file does not exist yet.
    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => Ok(Some(StoreSnapshot::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Write `snapshot`. Readers never observe a half-written file.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = snapshot.to_json()?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    /// Write `snapshot` unless a later generation is already on disk.
    ///
    /// Returns `false` when the snapshot was stale and skipped.
    pub fn save_generation(&self, generation: u64, snapshot: &StoreSnapshot) -> Result<bool> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *written {
            return Ok(false);
        }
        self.save(snapshot)?;
        *written = generation;
        Ok(true)
    }

    /// Open the store persisted at this path, or create an empty one.
    pub fn open_store(&self, schema: Schema, device_id: &str) -> Result<LocalStore> {
        let mut store = LocalStore::new(schema, device_id);
        if let Some(snapshot) = self.load()? {
            store.import_state(snapshot)?;
            tracing::info!(
                path = %self.path.display(),
                pending = store.pending_count(),
                "restored local store"
            );
        }
        Ok(store)
    }
}
