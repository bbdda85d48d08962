//! Checkpoint storage backends.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::CheckpointId;
use crate::partitioning::{DefaultHasher, Hasher};

/// Error type for storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Persistence backend for serialized instance state.
///
/// Records are keyed by [`CheckpointId`] and hold opaque bytes; a save
/// replaces any previous record for the same id.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Stores `state` under `id`.
    async fn save_state(&self, id: &CheckpointId, state: Bytes) -> Result<(), StorageError>;

    /// Returns the state stored under `id`, if any.
    async fn fetch_state(&self, id: &CheckpointId) -> Result<Option<Bytes>, StorageError>;

    /// Returns every stored id.
    async fn fetch_stored_keys(&self) -> Result<HashSet<CheckpointId>, StorageError>;
}

/// Volatile storage, mostly useful in tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    records: Mutex<HashMap<CheckpointId, Bytes>>,
}

impl InMemoryStateStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StateStorage for InMemoryStateStorage {
    async fn save_state(&self, id: &CheckpointId, state: Bytes) -> Result<(), StorageError> {
        self.records.lock().insert(id.clone(), state);
        Ok(())
    }

    async fn fetch_state(&self, id: &CheckpointId) -> Result<Option<Bytes>, StorageError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn fetch_stored_keys(&self) -> Result<HashSet<CheckpointId>, StorageError> {
        Ok(self.records.lock().keys().cloned().collect())
    }
}

/// Longest file name derived directly from a checkpoint id.
const MAX_ENCODED_NAME: usize = 200;
/// File name prefix of ids too long to encode.
const HASHED_PREFIX: char = '~';
/// Prefix of in-flight temporary files.
const TEMP_PREFIX: &str = ".checkpoint-";

/// Stores one file per checkpoint under `<root>/<prototype id>/<name>`.
///
/// `<name>` is the base64url form of the checkpoint id string. Ids whose
/// encoding would exceed [`MAX_ENCODED_NAME`] bytes are stored under
/// `~<fnv-1a hash>` instead, and such files start with the id string on
/// their own line so the id can be recovered and checked on fetch.
#[derive(Clone, Debug)]
pub struct FileSystemStateStorage {
    root: PathBuf,
}

enum FileName {
    Encoded(PathBuf),
    Hashed(PathBuf),
}

impl FileName {
    fn path(&self) -> &Path {
        match self {
            FileName::Encoded(path) | FileName::Hashed(path) => path,
        }
    }
}

impl FileSystemStateStorage {
    /// Creates a storage rooted at `root`. Directories are created on save.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checkpoint_file(&self, id: &CheckpointId) -> FileName {
        let dir = id
            .prototype_id
            .replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-', "_");
        let dir = if dir.is_empty() { "_".to_string() } else { dir };
        let dir = self.root.join(dir);
        let id = id.to_string();
        let encoded = URL_SAFE_NO_PAD.encode(id.as_bytes());
        if encoded.len() <= MAX_ENCODED_NAME {
            FileName::Encoded(dir.join(encoded))
        } else {
            let hash = DefaultHasher.hash(&id);
            FileName::Hashed(dir.join(format!("{}{:016x}", HASHED_PREFIX, hash)))
        }
    }

    /// Splits a hashed file into its id line and state.
    fn split_header(data: &[u8]) -> Option<(&str, &[u8])> {
        let newline = data.iter().position(|b| *b == b'\n')?;
        let id = std::str::from_utf8(&data[..newline]).ok()?;
        Some((id, &data[newline + 1..]))
    }

    async fn file_to_checkpoint_id(path: &Path) -> Option<CheckpointId> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with(HASHED_PREFIX) {
            let data = tokio::fs::read(path).await.ok()?;
            let (id, _) = Self::split_header(&data)?;
            return id.parse().ok();
        }
        let decoded = URL_SAFE_NO_PAD.decode(name).ok()?;
        String::from_utf8(decoded).ok()?.parse().ok()
    }
}

#[async_trait]
impl StateStorage for FileSystemStateStorage {
    async fn save_state(&self, id: &CheckpointId, state: Bytes) -> Result<(), StorageError> {
        let file = self.checkpoint_file(id);
        let header = match &file {
            FileName::Encoded(_) => None,
            FileName::Hashed(_) => Some(format!("{}\n", id)),
        };
        let target = file.path().to_path_buf();
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await?;
        debug!(checkpoint_id = %id, path = %target.display(), "writing checkpoint");

        // One temporary file per save; concurrent saves of an id never share it.
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&dir)?;
            if let Some(header) = header {
                tmp.write_all(header.as_bytes())?;
            }
            tmp.write_all(&state)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Backend(format!("checkpoint writer failed: {}", e)))?
    }

    async fn fetch_state(&self, id: &CheckpointId) -> Result<Option<Bytes>, StorageError> {
        let file = self.checkpoint_file(id);
        let data = match tokio::fs::read(file.path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match file {
            FileName::Encoded(_) => Ok(Some(Bytes::from(data))),
            FileName::Hashed(path) => match Self::split_header(&data) {
                Some((stored, state)) if stored == id.to_string() => {
                    Ok(Some(Bytes::copy_from_slice(state)))
                }
                Some((stored, _)) => {
                    warn!(
                        checkpoint_id = %id,
                        stored,
                        path = %path.display(),
                        "checkpoint file holds another id"
                    );
                    Ok(None)
                }
                None => Err(StorageError::Backend(format!(
                    "checkpoint file {} has no id header",
                    path.display()
                ))),
            },
        }
    }

    async fn fetch_stored_keys(&self) -> Result<HashSet<CheckpointId>, StorageError> {
        let mut keys = HashSet::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let in_flight = file.file_name().to_string_lossy().starts_with(TEMP_PREFIX);
                if in_flight || !file.file_type().await?.is_file() {
                    continue;
                }
                match Self::file_to_checkpoint_id(&path).await {
                    Some(id) => {
                        keys.insert(id);
                    }
                    None => warn!(path = %path.display(), "ignoring unrecognized checkpoint file"),
                }
            }
        }
        Ok(keys)
    }
}
