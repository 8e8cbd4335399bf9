use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, Storage, StorageError, StorageResult};

/// Backend held entirely in memory, for tests and throwaway nodes
#[derive(Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored bytes without any checks; lets tests simulate disk corruption
    pub async fn tamper(&self, key: &str, data: Vec<u8>) {
        self.entries.write().await.insert(key.to_string(), data);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.entries.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match self.entries.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::KeyNotFound(key.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(self.entries.read().await.keys().cloned().collect());
        }
        // Only whole path segments match: "shards" must not match "shardsx/.."
        let dir = format!("{}/", trimmed);
        Ok(self
            .entries
            .read()
            .await
            .range(dir.clone()..)
            .take_while(|(k, _)| k.starts_with(&dir))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn base_path(&self) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_respects_segments() {
        let storage = MemoryStorage::new();
        storage.put("manifests/a", b"1").await.unwrap();
        storage.put("manifests/b", b"2").await.unwrap();
        storage.put("manifestsx/c", b"3").await.unwrap();

        assert_eq!(
            storage.list("manifests").await.unwrap(),
            vec!["manifests/a".to_string(), "manifests/b".to_string()]
        );
        assert_eq!(storage.list("").await.unwrap().len(), 3);
        assert_eq!(storage.len().await, 3);
    }

    #[tokio::test]
    async fn test_missing_keys() {
        let storage = MemoryStorage::new();
        storage.put("docs/app/doc", b"bytes").await.unwrap();
        storage.delete("docs/app/doc").await.unwrap();

        assert!(storage.is_empty().await);
        assert!(matches!(
            storage.get("docs/app/doc").await,
            Err(StorageError::KeyNotFound(_))
        ));
        assert!(storage.delete("docs/app/doc").await.is_err());
        assert!(matches!(
            storage.put("../escape", b"x").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_tamper_bypasses_validation() {
        let storage = MemoryStorage::new();
        storage.put("shards/ab/sha256-ab", b"good").await.unwrap();
        storage.tamper("shards/ab/sha256-ab", b"bad".to_vec()).await;
        assert_eq!(storage.get("shards/ab/sha256-ab").await.unwrap(), b"bad");
    }
}
