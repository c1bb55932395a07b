//! Snapshot persistence.
//!
//! The file store writes the snapshot to a temporary file in the target
//! directory, syncs it and renames it over the previous state, so a reader
//! only ever observes a complete snapshot. A snapshot that cannot be parsed
//! or that violates the topology invariants is refused rather than repaired.
//!
//! Writers serialize through [`Store::lock`]. For the file store this is an
//! exclusive advisory lock on a `<state>.lock` file next to the snapshot, so
//! separate `topoctl` processes sharing one state file take turns.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::fs_std::FileExt;
use log::{debug, info, warn};
use tempfile::NamedTempFile;

use super::types::Snapshot;
use crate::error::{ControllerError, Result};

/// Durable home of the topology snapshot
pub trait Store: Send + Sync {
    /// Read the last saved snapshot, or an empty one if nothing was saved yet.
    fn load(&self) -> Result<Snapshot>;

    /// Replace the saved snapshot as a single visible write.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Block until this caller is the only writer. Hold the returned lock
    /// from `load` through `save`.
    fn lock(&self) -> Result<StoreLock>;
}

/// Exclusive hold on a store, released on drop
#[derive(Debug)]
pub struct StoreLock {
    file: Option<File>,
}

impl StoreLock {
    /// Lock for stores that live inside one process, where the caller's own
    /// mutex already serializes writers.
    pub fn in_process() -> Self {
        Self { file: None }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = FileExt::unlock(file) {
                warn!("Failed to release state lock {:?}: {}", file, e);
            }
        }
    }
}

fn encode(snapshot: &Snapshot) -> Result<String, serde_json::Error> {
    let mut text = serde_json::to_string_pretty(snapshot)?;
    text.push('\n');
    Ok(text)
}

fn decode(text: &str) -> Result<Snapshot, String> {
    let snapshot: Snapshot = serde_json::from_str(text).map_err(|e| e.to_string())?;
    snapshot.validate()?;
    Ok(snapshot)
}

/// JSON snapshot on the local filesystem
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `<state>.lock` in the snapshot's directory
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("topology"));
        name.push(".lock");
        self.directory().join(name)
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Snapshot> {
        match fs::metadata(&self.path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}, starting from an empty topology", self.path);
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(ControllerError::store(&self.path, e)),
        }
        let text = fs::read_to_string(&self.path).map_err(|e| ControllerError::store(&self.path, e))?;
        let snapshot = decode(&text).map_err(|e| ControllerError::store(&self.path, e))?;
        debug!(
            "Loaded snapshot from {:?}: {} nodes, {} links",
            self.path,
            snapshot.nodes.len(),
            snapshot.links.len()
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let text = encode(snapshot).map_err(|e| ControllerError::store(&self.path, e))?;
        let directory = self.directory();
        fs::create_dir_all(&directory).map_err(|e| ControllerError::store(&self.path, e))?;

        let mut temp = NamedTempFile::new_in(&directory).map_err(|e| ControllerError::store(&self.path, e))?;
        temp.write_all(text.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| ControllerError::store(&self.path, e))?;
        temp.persist(&self.path)
            .map_err(|e| ControllerError::store(&self.path, e.error))?;

        debug!("Saved snapshot to {:?}", self.path);
        Ok(())
    }

    fn lock(&self) -> Result<StoreLock> {
        let path = self.lock_path();
        fs::create_dir_all(self.directory()).map_err(|e| ControllerError::store(&path, e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ControllerError::store(&path, e))?;
        debug!("Waiting for state lock {:?}", path);
        file.lock_exclusive()
            .map_err(|e| ControllerError::store(&path, e))?;

        Ok(StoreLock { file: Some(file) })
    }
}

/// Snapshot kept in process memory, serialized the same way as on disk
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from raw contents, as if they had been read from disk
    pub fn with_contents(text: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(text.into())),
        }
    }

    /// The serialized snapshot, if one was saved
    pub fn contents(&self) -> Option<String> {
        self.contents.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Snapshot> {
        let guard = self
            .contents
            .lock()
            .map_err(|_| ControllerError::store("<memory>", "lock poisoned"))?;
        match guard.as_deref() {
            None => Ok(Snapshot::default()),
            Some(text) => decode(text).map_err(|e| ControllerError::store("<memory>", e)),
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let text = encode(snapshot).map_err(|e| ControllerError::store("<memory>", e))?;
        let mut guard = self
            .contents
            .lock()
            .map_err(|_| ControllerError::store("<memory>", "lock poisoned"))?;
        *guard = Some(text);
        Ok(())
    }

    fn lock(&self) -> Result<StoreLock> {
        Ok(StoreLock::in_process())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkParams;
    use crate::topology::lifecycle::add_link;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.declare_node("r1", Some(Ipv4Addr::new(1, 1, 1, 1)));
        add_link(
            &mut snapshot,
            ("r1", Ipv4Addr::new(10, 0, 0, 1)),
            ("r2", Ipv4Addr::new(10, 0, 0, 2)),
            LinkParams::new(10.0, 32.0, 2.0).unwrap(),
        )
        .unwrap();
        snapshot
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), Snapshot::default());
    }

    #[test]
    fn test_unreadable_location_fails_closed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        // The parent is a regular file, so this is not a plain "not found"
        let store = FileStore::new(blocker.join("state.json"));
        assert!(matches!(
            store.load(),
            Err(ControllerError::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let held = FileStore::new(&path).lock().unwrap();
        assert!(dir.path().join("state.json.lock").exists());

        // A separate handle on the same state waits for the first to go
        let waiter = FileStore::new(&path);
        let started = Instant::now();
        let handle = thread::spawn(move || {
            let _lock = waiter.lock().unwrap();
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(300));
        drop(held);

        let waited = handle.join().unwrap();
        assert!(waited >= Duration::from_millis(250), "waited {:?}", waited);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("state.json"));
        let snapshot = sample_snapshot();

        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), snapshot);

        // No temporary files are left next to the snapshot
        let entries: Vec<_> = fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_resave_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::new(&path);
        store.save(&sample_snapshot()).unwrap();
        let first = fs::read(&path).unwrap();

        store.save(&store.load().unwrap()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_corrupt_file_fails_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"nodes\": {\"r1\": ").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.load(), Err(ControllerError::StoreUnavailable { .. })));
    }

    #[test]
    fn test_inconsistent_snapshot_fails_closed() {
        let mut snapshot = sample_snapshot();
        snapshot.nodes.get_mut("r2").unwrap().ips.clear();
        let text = serde_json::to_string(&snapshot).unwrap();

        let store = MemoryStore::with_contents(text);
        assert!(matches!(store.load(), Err(ControllerError::StoreUnavailable { .. })));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), Snapshot::default());

        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();
        let saved = store.contents().unwrap();

        store.save(&store.load().unwrap()).unwrap();
        assert_eq!(store.contents().unwrap(), saved);
    }
}
