//! Persisted device state.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use pushsync_protocol::{DeviceMetadata, InterestSet};
use pushsync_storage::{FileBackend, StorageBackend};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Everything the engine remembers about the device between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceState {
    /// Id assigned by the directory. Present once the device is started.
    pub device_id: Option<String>,
    /// Last push token the directory accepted.
    pub token: Option<String>,
    /// Bound user.
    pub user_id: Option<String>,
    /// Local working copy of the interest set.
    pub interests: InterestSet,
    /// Hash of the interest set the directory last confirmed.
    pub confirmed_interests_hash: Option<String>,
    /// Metadata the directory last confirmed.
    pub confirmed_metadata: Option<DeviceMetadata>,
}

impl DeviceState {
    /// Returns true once the device holds a directory id.
    pub fn is_started(&self) -> bool {
        self.device_id.is_some()
    }
}

/// Durable storage for [`DeviceState`], scoped to one engine instance.
pub trait DeviceStateStore: Send {
    /// Loads the stored state, or the default state if none was saved.
    fn load(&self) -> EngineResult<DeviceState>;

    /// Replaces the stored state.
    fn save(&mut self, state: &DeviceState) -> EngineResult<()>;
}

/// Ephemeral store; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `state`.
    pub fn with_state(state: DeviceState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Returns a copy of the stored state.
    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }
}

impl DeviceStateStore for MemoryStateStore {
    fn load(&self) -> EngineResult<DeviceState> {
        Ok(self.state.lock().clone())
    }

    fn save(&mut self, state: &DeviceState) -> EngineResult<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

const SNAPSHOT_VERSION: u16 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u16,
    state: &'a DeviceState,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    version: u16,
    #[serde(default)]
    state: DeviceState,
}

/// Store that writes a CBOR snapshot through [`StorageBackend::replace`].
///
/// With a [`FileBackend`] each save is a temp-file write, fsync and rename,
/// so a crash leaves either the previous or the new snapshot.
pub struct FileStateStore {
    backend: Box<dyn StorageBackend>,
}

impl FileStateStore {
    /// Opens the snapshot file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    /// Uses an arbitrary backend for the snapshot.
    pub fn with_backend(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

impl DeviceStateStore for FileStateStore {
    fn load(&self) -> EngineResult<DeviceState> {
        let bytes = self.backend.read_all()?;
        if bytes.is_empty() {
            return Ok(DeviceState::default());
        }

        let snapshot: Snapshot = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| EngineError::CorruptState(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(EngineError::CorruptState(format!(
                "snapshot version {} is newer than {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot.state)
    }

    fn save(&mut self, state: &DeviceState) -> EngineResult<()> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(
            &SnapshotRef {
                version: SNAPSHOT_VERSION,
                state,
            },
            &mut bytes,
        )
        .map_err(|e| EngineError::CorruptState(e.to_string()))?;
        self.backend.replace(&bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for FileStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateStore").finish_non_exhaustive()
    }
}
