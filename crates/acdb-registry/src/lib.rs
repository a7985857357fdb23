//! Database registry (C3): tracks the set of opened ACDB databases, the
//! delta files layered over them, and cross-database GUID consistency for
//! shared subgraphs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use acdb_core::{ChunkedFile, Guid, Result, SubgraphId};
use thiserror::Error;

/// Errors specific to registry bookkeeping. Mapped onto [`acdb_core::AcdbError`]
/// at the crate boundary the way [`acdb_core::ChunkError`] is mapped in
/// `acdb-core`.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("shared subgraph {sg_id} GUID mismatch: existing database reports {existing}, new database reports {incoming}")]
    GuidMismatch {
        sg_id: SubgraphId,
        existing: Guid,
        incoming: Guid,
    },

    #[error("no registered database for handle {0:?}")]
    UnknownHandle(DbHandle),

    #[error(transparent)]
    Core(#[from] acdb_core::AcdbError),
}

impl From<RegistryError> for acdb_core::AcdbError {
    fn from(e: RegistryError) -> Self {
        use acdb_core::AcdbError;
        match e {
            RegistryError::GuidMismatch { .. } => AcdbError::Failed,
            RegistryError::UnknownHandle(_) => AcdbError::Handle,
            RegistryError::Core(inner) => inner,
        }
    }
}

/// Opaque handle returned by [`Registry::add`]. Stays valid until the
/// matching [`Registry::remove`]; the registry enforces no further lifetime
/// discipline beyond that, matching the contract's "callers must enforce
/// this via their own reference discipline" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbHandle(u64);

/// Which on-disk role a path plays for a database set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// Directory the process was launched from; read-only.
    Workspace,
    /// The immutable `.acdb` database file itself.
    Acdb,
    /// Directory the registry may write delta files into.
    WritableDir,
}

/// Per-handle path bookkeeping, one entry per call to [`Registry::add`].
#[derive(Debug, Clone)]
pub struct FileSet {
    pub handle: DbHandle,
    pub workspace: Option<PathBuf>,
    pub acdb_path: PathBuf,
    pub writable_dir: Option<PathBuf>,
}

struct Entry {
    file_set: FileSet,
    base: ChunkedFile,
    /// Delta overlay loaded from `writable_dir`, if any. Looked up before
    /// `base` so a delta shadows the shipped database.
    delta: Option<ChunkedFile>,
    imports: HashMap<SubgraphId, Guid>,
    exports: HashMap<SubgraphId, Guid>,
}

struct State {
    next_handle: u64,
    entries: Vec<Entry>,
}

/// The registry. A single lock guards `add`/`remove`/writable-path updates;
/// reads through an already-returned handle never contend on it.
pub struct Registry {
    state: Mutex<State>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                entries: Vec::new(),
            }),
        }
    }

    /// Loads `acdb_path`, validates its shared-subgraph GUIDs against every
    /// database already registered, and on success returns a handle. On a
    /// GUID mismatch the add is rolled back — nothing is added.
    pub fn add(
        &self,
        acdb_path: impl Into<PathBuf>,
        workspace: Option<PathBuf>,
        writable_dir: Option<PathBuf>,
    ) -> std::result::Result<DbHandle, RegistryError> {
        let acdb_path = acdb_path.into();
        let base = ChunkedFile::open(&acdb_path)?;
        let (imports, exports) = read_shared_subgraph_properties(&base)?;

        let mut state = self.state.lock().expect("registry lock poisoned");
        for existing in &state.entries {
            for (sg_id, guid) in &imports {
                if let Some(known) = existing.exports.get(sg_id).or(existing.imports.get(sg_id)) {
                    if known != guid {
                        tracing::warn!(
                            sg_id = sg_id.0,
                            existing = %known,
                            incoming = %guid,
                            "shared subgraph GUID mismatch, rolling back add"
                        );
                        return Err(RegistryError::GuidMismatch {
                            sg_id: *sg_id,
                            existing: *known,
                            incoming: *guid,
                        });
                    }
                }
            }
            for (sg_id, guid) in &exports {
                if let Some(known) = existing.imports.get(sg_id).or(existing.exports.get(sg_id)) {
                    if known != guid {
                        tracing::warn!(
                            sg_id = sg_id.0,
                            existing = %known,
                            incoming = %guid,
                            "shared subgraph GUID mismatch, rolling back add"
                        );
                        return Err(RegistryError::GuidMismatch {
                            sg_id: *sg_id,
                            existing: *known,
                            incoming: *guid,
                        });
                    }
                }
            }
        }

        let handle = DbHandle(state.next_handle);
        state.next_handle += 1;
        tracing::info!(?handle, acdb_path = %acdb_path.display(), "registered database");

        let delta = match &writable_dir {
            Some(dir) => load_delta(dir, &acdb_path)?,
            None => None,
        };

        state.entries.push(Entry {
            file_set: FileSet {
                handle,
                workspace,
                acdb_path,
                writable_dir,
            },
            base,
            delta,
            imports,
            exports,
        });
        Ok(handle)
    }

    /// Drops a registered database. Existing readers holding `handle` must
    /// stop dereferencing it once this returns; the registry does not track
    /// them.
    pub fn remove(&self, handle: DbHandle) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let before = state.entries.len();
        state.entries.retain(|e| e.file_set.handle != handle);
        if state.entries.len() == before {
            return Err(RegistryError::UnknownHandle(handle));
        }
        tracing::info!(?handle, "unregistered database");
        Ok(())
    }

    /// Updates (or clears) the writable directory for `handle`, reloading
    /// its delta overlay.
    pub fn set_writable_path(
        &self,
        handle: DbHandle,
        writable_dir: Option<PathBuf>,
    ) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.file_set.handle == handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        entry.delta = match &writable_dir {
            Some(dir) => load_delta(dir, &entry.file_set.acdb_path)?,
            None => None,
        };
        entry.file_set.writable_dir = writable_dir;
        Ok(())
    }

    /// Reads `length` bytes at `offset` from the path of `path_type` for
    /// `handle`. For [`PathType::Acdb`], the delta overlay (if loaded) is
    /// consulted first so callers transparently see persisted writes.
    pub fn get_file(
        &self,
        handle: DbHandle,
        path_type: PathType,
        offset: usize,
        length: usize,
    ) -> std::result::Result<Vec<u8>, RegistryError> {
        let state = self.state.lock().expect("registry lock poisoned");
        let entry = state
            .entries
            .iter()
            .find(|e| e.file_set.handle == handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        let path = match path_type {
            PathType::Workspace => entry
                .file_set
                .workspace
                .clone()
                .ok_or(RegistryError::Core(acdb_core::AcdbError::NotExist))?,
            PathType::Acdb => entry.file_set.acdb_path.clone(),
            PathType::WritableDir => entry
                .file_set
                .writable_dir
                .clone()
                .ok_or(RegistryError::Core(acdb_core::AcdbError::NotExist))?,
        };
        let bytes = fs::read(&path).map_err(acdb_core::AcdbError::from)?;
        let end = offset
            .checked_add(length)
            .filter(|&e| e <= bytes.len())
            .ok_or(RegistryError::Core(acdb_core::AcdbError::BadParam(
                "requested range exceeds file size".into(),
            )))?;
        Ok(bytes[offset..end].to_vec())
    }

    /// Descriptors for every registered database.
    pub fn get_all_file_sets(&self) -> Vec<FileSet> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.entries.iter().map(|e| e.file_set.clone()).collect()
    }

    /// The active resolver input for `handle`: the delta overlay if one is
    /// loaded, otherwise the base database.
    pub fn chunked_file(&self, handle: DbHandle) -> std::result::Result<ChunkedFile, RegistryError> {
        let state = self.state.lock().expect("registry lock poisoned");
        let entry = state
            .entries
            .iter()
            .find(|e| e.file_set.handle == handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        Ok(entry.delta.clone().unwrap_or_else(|| entry.base.clone()))
    }

    /// Persists `bytes` as the delta file for `handle` under its writable
    /// directory and reloads the overlay so subsequent reads see it.
    pub fn write_delta(
        &self,
        handle: DbHandle,
        bytes: &[u8],
    ) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.file_set.handle == handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        let dir = entry
            .file_set
            .writable_dir
            .clone()
            .ok_or(RegistryError::Core(acdb_core::AcdbError::NotReady))?;
        let delta_path = delta_path_for(&dir, &entry.file_set.acdb_path);
        fs::write(&delta_path, bytes).map_err(acdb_core::AcdbError::from)?;
        entry.delta = Some(ChunkedFile::from_bytes(Arc::from(bytes.to_vec()))?);
        Ok(())
    }
}

fn delta_path_for(dir: &Path, acdb_path: &Path) -> PathBuf {
    let stem = acdb_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".into());
    dir.join(format!("{stem}.delta"))
}

fn load_delta(dir: &Path, acdb_path: &Path) -> Result<Option<ChunkedFile>> {
    let delta_path = delta_path_for(dir, acdb_path);
    match fs::read(&delta_path) {
        Ok(bytes) => Ok(Some(ChunkedFile::from_bytes(Arc::from(bytes))?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(acdb_core::AcdbError::from(e)),
    }
}

// Reserved chunk holding `(sg_id, direction, guid)` triples; `direction` 0
// = imported, 1 = exported. A database with no shared subgraphs simply
// omits this chunk.
const CHUNK_SHARED_SUBGRAPHS: u32 = 0x00F0;

fn read_shared_subgraph_properties(
    file: &ChunkedFile,
) -> Result<(HashMap<SubgraphId, Guid>, HashMap<SubgraphId, Guid>)> {
    let mut imports = HashMap::new();
    let mut exports = HashMap::new();
    let Ok(bytes) = file.chunk_bytes(CHUNK_SHARED_SUBGRAPHS) else {
        return Ok((imports, exports));
    };
    let mut cursor = 0usize;
    while cursor + 21 <= bytes.len() {
        let sg_id = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        let direction = bytes[cursor + 4];
        let mut guid_bytes = [0u8; 16];
        guid_bytes.copy_from_slice(&bytes[cursor + 5..cursor + 21]);
        let guid = Guid(guid_bytes);
        if direction == 0 {
            imports.insert(SubgraphId(sg_id), guid);
        } else {
            exports.insert(SubgraphId(sg_id), guid);
        }
        cursor += 21;
    }
    Ok((imports, exports))
}
