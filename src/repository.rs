//! Storage collaborators: the content store holding script bodies and the metadata store
//! holding the registry snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::script::ScriptRecord;

/// Storage for script bodies, keyed by script id.
pub trait ContentStore: Send + Sync {
    /// Read a body. `Ok(None)` when the store has no entry for `id`.
    fn read_body(&self, id: &str) -> AppResult<Option<String>>;

    fn write_body(&self, id: &str, body: &str) -> AppResult<()>;

    /// Delete a body. Returns true if something was removed.
    fn delete(&self, id: &str) -> AppResult<bool>;

    /// Ids of all stored bodies.
    fn list(&self) -> AppResult<BTreeSet<String>>;
}

/// Persistence for the registry snapshot.
pub trait MetadataStore: Send + Sync {
    /// Load the persisted records; empty when nothing was saved yet.
    fn load_snapshot(&self) -> AppResult<Vec<ScriptRecord>>;

    fn save_snapshot(&self, records: &[ScriptRecord]) -> AppResult<()>;
}

/// Write `bytes` to `path` through a temporary sibling file and a rename, so a crash
/// mid-write never leaves a truncated file behind.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::storage_io(format!("cannot create {}", parent.display()), e)
        })?;
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)
        .map_err(|e| AppError::storage_io(format!("cannot write {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        AppError::storage_io(format!("cannot replace {}", path.display()), e)
    })
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Read a JSON file, `Ok(None)` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> AppResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::storage_io(
            format!("cannot read {}", path.display()),
            e,
        )),
    }
}

/// Script bodies stored as one file per id in a directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    dir: PathBuf,
    extension: String,
}

impl FsContentStore {
    /// Open (and create if needed) a script directory. Only files ending in `.{extension}`
    /// are listed.
    pub fn open(dir: impl Into<PathBuf>, extension: impl Into<String>) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            error!("Could not create script directory {}: {}", dir.display(), e);
            AppError::storage_io(format!("cannot create {}", dir.display()), e)
        })?;
        Ok(Self {
            dir,
            extension: extension.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> AppResult<PathBuf> {
        let candidate = Path::new(id);
        let single_component = candidate.components().count() == 1
            && candidate.file_name().map(|n| n == candidate.as_os_str()).unwrap_or(false);
        if !single_component {
            warn!("Folder traversal detected, script id received: {}", id);
            return Err(AppError::invalid("id", format!("invalid file path: {}", id)));
        }
        Ok(self.dir.join(candidate))
    }
}

impl ContentStore for FsContentStore {
    fn read_body(&self, id: &str) -> AppResult<Option<String>> {
        let path = self.path_for(id)?;
        match fs::read_to_string(&path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No script body for {}", id);
                Ok(None)
            }
            Err(e) => Err(AppError::storage_io(
                format!("cannot read {}", path.display()),
                e,
            )),
        }
    }

    fn write_body(&self, id: &str, body: &str) -> AppResult<()> {
        let path = self.path_for(id)?;
        atomic_write(&path, body.as_bytes())
    }

    fn delete(&self, id: &str) -> AppResult<bool> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::storage_io(
                format!("not able to delete {}", path.display()),
                e,
            )),
        }
    }

    fn list(&self) -> AppResult<BTreeSet<String>> {
        debug!("Listing files of {}", self.dir.display());
        let suffix = format!(".{}", self.extension);
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            AppError::storage_io(format!("cannot list {}", self.dir.display()), e)
        })?;

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                AppError::storage_io(format!("cannot list {}", self.dir.display()), e)
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(&suffix) {
                    ids.insert(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

/// Registry snapshot persisted as a JSON array.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    path: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataStore for JsonMetadataStore {
    fn load_snapshot(&self) -> AppResult<Vec<ScriptRecord>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save_snapshot(&self, records: &[ScriptRecord]) -> AppResult<()> {
        write_json(&self.path, records)
    }
}

/// In-memory content store
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    bodies: Mutex<BTreeMap<String, String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for MemoryContentStore {
    fn read_body(&self, id: &str) -> AppResult<Option<String>> {
        let guard = self.bodies.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(id).cloned())
    }

    fn write_body(&self, id: &str, body: &str) -> AppResult<()> {
        let mut guard = self.bodies.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(id.to_string(), body.to_string());
        Ok(())
    }

    fn delete(&self, id: &str) -> AppResult<bool> {
        let mut guard = self.bodies.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.remove(id).is_some())
    }

    fn list(&self) -> AppResult<BTreeSet<String>> {
        let guard = self.bodies.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.keys().cloned().collect())
    }
}

/// In-memory metadata store. Can be told to fail saves, to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    snapshot: Mutex<Vec<ScriptRecord>>,
    fail_saves: Mutex<bool>,
    saves: Mutex<usize>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(records: Vec<ScriptRecord>) -> Self {
        Self {
            snapshot: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<ScriptRecord> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_snapshot(&self) -> AppResult<Vec<ScriptRecord>> {
        Ok(self.snapshot())
    }

    fn save_snapshot(&self, records: &[ScriptRecord]) -> AppResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(AppError::storage("metadata store unavailable"));
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
