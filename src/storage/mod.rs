//! Byte-level persistence for the node.
//!
//! `Storage` is a flat key/value abstraction with `/`-separated keys;
//! `ContentStore` builds the content-addressed blob and shard layout on top.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub mod content_store;
pub mod memory_storage;

pub use content_store::{ContentStore, ReadGuard, ReaderRegistry, ExclusiveGuard};
pub use memory_storage::MemoryStorage;

/// Failures of a storage backend
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage root unavailable: {0}")]
    RootUnavailable(String),

    #[error("Integrity check failed for {0}")]
    Integrity(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() {
            StorageError::DeserializationError(err.to_string())
        } else {
            StorageError::SerializationError(err.to_string())
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Flat key/value backend underneath the content store, the custodian table,
/// the document store and the key store
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Write `data` at `key`, replacing any previous value
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// `KeyNotFound` when nothing is stored at `key`
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// `KeyNotFound` when nothing is stored at `key`
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Every key under `prefix`, at any depth, sorted
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// On-disk root, if the backend has one
    fn base_path(&self) -> Option<PathBuf>;
}

/// JSON records on top of any backend
#[async_trait]
pub trait JsonStorage: Storage {
    async fn put_json<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> StorageResult<()> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.put(key, &encoded).await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> StorageResult<T> {
        let raw = self.get(key).await?;
        serde_json::from_slice(&raw).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}

impl<T: Storage + ?Sized> JsonStorage for T {}

/// Reject keys that could escape the storage root
pub fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Backend mapping each key to a file below the storage root
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Open the storage root, creating it if needed and probing that it is
    /// writable. Failure here is fatal for the node.
    pub fn open(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::RootUnavailable(format!("{:?}: {}", base_path, e)))?;

        let probe = base_path.join(".write-probe");
        std::fs::write(&probe, b"ok")
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|e| StorageError::RootUnavailable(format!("{:?}: {}", base_path, e)))?;

        info!("Opened storage root at {:?}", base_path);
        Ok(Self { base_path })
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.base_path.clone();
        for part in key.split('/') {
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::IoError(format!("creating {:?}: {}", parent, e)))?;
        }

        // Write beside the target and rename so readers never see a partial file
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::IoError(format!("writing {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::IoError(format!("committing {:?}: {}", path, e)))
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::KeyNotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::IoError(format!("reading {:?}: {}", path, e))),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::KeyNotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::IoError(format!("removing {:?}: {}", path, e))),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut result = Vec::new();
        let trimmed = prefix.trim_end_matches('/');
        let root = if trimmed.is_empty() {
            self.base_path.clone()
        } else {
            self.path_for(trimmed)?
        };

        if tokio::fs::metadata(&root).await.is_err() {
            return Ok(result);
        }

        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::IoError(format!("listing {:?}: {}", dir, e)))?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.base_path) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    result.push(key);
                }
            }
        }

        result.sort();
        Ok(result)
    }

    fn base_path(&self) -> Option<PathBuf> {
        Some(self.base_path.clone())
    }
}
