use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// An error interacting with the [`Persistence`] store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Reading the stored bytes failed.
    #[error("failed to read state for key {key:?}")]
    Read {
        /// The logical key.
        key: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the bytes failed; the previous value is still in place.
    #[error("failed to write state for key {key:?}")]
    Write {
        /// The logical key.
        key: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The stored document does not decode into the expected type.
    #[error("failed to decode state for key {key:?}")]
    Decode {
        /// The logical key.
        key: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The value does not encode. Indicates a bug rather than an IO problem.
    #[error("failed to encode state for key {key:?}")]
    Encode {
        /// The logical key.
        key: String,
        /// The underlying encode error.
        #[source]
        source: serde_json::Error,
    },
}

/// A durable key→document store with atomic replacement.
///
/// Keys are slash-separated logical names (`aggregator`, `sender/<endpoint>`).
/// The disk variant maps each key to one JSON file under the state directory
/// and replaces it via write-temp-then-rename, so a reader never observes a
/// partial document. The memory variant backs `--no-state` runs.
///
/// The store is single-writer per key; each service owns its own keys.
#[derive(Clone, Debug)]
pub enum Persistence {
    /// Volatile in-memory store.
    Memory(Arc<Mutex<HashMap<String, Vec<u8>>>>),
    /// One file per key under the given directory.
    Disk(PathBuf),
}

impl Persistence {
    /// Creates an in-memory store.
    pub fn memory() -> Self {
        Self::Memory(Arc::default())
    }

    /// Creates a disk store rooted at `state_dir`, creating the directory.
    pub fn disk(state_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|source| PersistenceError::Write {
            key: state_dir.display().to_string(),
            source,
        })?;
        Ok(Self::Disk(state_dir))
    }

    fn path_for(state_dir: &Path, key: &str) -> PathBuf {
        state_dir.join(format!("{key}.json"))
    }

    /// Loads the bytes stored for a key, or `None` if nothing was stored.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match self {
            Self::Memory(map) => Ok(map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()),
            Self::Disk(state_dir) => {
                match tokio::fs::read(Self::path_for(state_dir, key)).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(PersistenceError::Read {
                        key: key.to_owned(),
                        source,
                    }),
                }
            }
        }
    }

    /// Atomically replaces the bytes stored for a key.
    ///
    /// Once this returns `Ok`, a `load` on a fresh process observes the new
    /// bytes.
    pub async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError> {
        match self {
            Self::Memory(map) => {
                map.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_owned(), bytes);
                Ok(())
            }
            Self::Disk(state_dir) => {
                let path = Self::path_for(state_dir, key);
                let write = |source| PersistenceError::Write {
                    key: key.to_owned(),
                    source,
                };

                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(write)?;
                }

                let temp = path.with_extension("json.tmp");
                tokio::fs::write(&temp, &bytes).await.map_err(write)?;
                tokio::fs::rename(&temp, &path).await.map_err(write)?;
                Ok(())
            }
        }
    }

    /// Loads and decodes the JSON document stored for a key.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, PersistenceError> {
        match self.load(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| PersistenceError::Decode {
                    key: key.to_owned(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Encodes a value to JSON and stores it for a key.
    pub async fn store_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(value).map_err(|source| PersistenceError::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.store(key, bytes).await
    }

    /// Enumerates the keys stored directly below a prefix.
    pub async fn keys_under(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        match self {
            Self::Memory(map) => {
                let needle = format!("{prefix}/");
                Ok(map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .filter(|key| key.starts_with(&needle))
                    .cloned()
                    .collect())
            }
            Self::Disk(state_dir) => {
                let mut keys = Vec::new();
                let mut dir = match tokio::fs::read_dir(state_dir.join(prefix)).await {
                    Ok(dir) => dir,
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(keys)
                    }
                    Err(source) => {
                        return Err(PersistenceError::Read {
                            key: prefix.to_owned(),
                            source,
                        })
                    }
                };

                while let Some(entry) = dir.next_entry().await.map_err(|source| {
                    PersistenceError::Read {
                        key: prefix.to_owned(),
                        source,
                    }
                })? {
                    let path = entry.path();
                    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                            keys.push(format!("{prefix}/{stem}"));
                        }
                    }
                }

                Ok(keys)
            }
        }
    }
}
