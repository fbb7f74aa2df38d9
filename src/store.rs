//! Injected persistence for the purchase ledger and engagement counter.
//!
//! The ledger and counter own their in-memory state and write snapshots
//! through a [`StateStore`]. State lives in named top-level collections
//! (`purchases`, `claps`), each a single JSON document, mirroring the
//! key-per-collection layout the data originally lived in.
//!
//! Two backends are provided: [`MemoryStore`] for tests and ephemeral runs,
//! and [`JsonFileStore`] with an explicit open-at-startup / flush-at-shutdown
//! lifecycle.

use dashmap::DashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Collection key holding the append-only purchase sequence.
pub const PURCHASES_COLLECTION: &str = "purchases";
/// Collection key holding per-resource clap data.
pub const CLAPS_COLLECTION: &str = "claps";

/// Errors raised by a state store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read state file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path:?} is not valid JSON")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A keyed document store for mutable application state.
///
/// Implementations must be safe to call from concurrent request handlers;
/// callers serialize writes per collection.
pub trait StateStore: Send + Sync {
    /// Loads a collection, `None` when it has never been saved.
    fn load(&self, collection: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Replaces a collection with a new snapshot.
    fn save(&self, collection: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Forces buffered state to durable storage. Called at shutdown.
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory store with no durability. Suitable for tests and demo runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, collection: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.collections.get(collection).map(|v| v.clone()))
    }

    fn save(&self, collection: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.collections.insert(collection.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// File-backed store holding all collections in one JSON document.
///
/// The file is read once at open; every save rewrites it via a temporary
/// file and atomic rename, so a crash mid-write leaves the previous
/// snapshot intact.
pub struct JsonFileStore {
    path: PathBuf,
    /// Guards the read-modify-write cycle on the backing file.
    state: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing state if the file is present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                match value {
                    serde_json::Value::Object(map) => map,
                    _ => {
                        return Err(StoreError::Corrupt {
                            path,
                            source: serde::de::Error::custom("expected a top-level object"),
                        });
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn write_locked(
        &self,
        state: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let map_write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(&serde_json::Value::Object(state.clone()))
            .expect("JSON maps always serialize");
        let mut file = std::fs::File::create(&tmp).map_err(map_write_err)?;
        file.write_all(&bytes).map_err(map_write_err)?;
        file.sync_all().map_err(map_write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(map_write_err)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, collection: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let state = self.state.lock().expect("store lock poisoned");
        Ok(state.get(collection).cloned())
    }

    fn save(&self, collection: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.insert(collection.to_string(), value);
        self.write_locked(&state)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let state = self.state.lock().expect("store lock poisoned");
        self.write_locked(&state)
    }
}
