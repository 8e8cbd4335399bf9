//! Change-log persistence for mergeable documents.
//!
//! Each document is kept as one bincode record at `docs/{app}/{doc}` holding
//! the saved document bytes and a summary of its heads.

use std::sync::Arc;

use automerge::Automerge;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{encode_heads, SyncError};
use crate::storage::{Storage, StorageError};

const DOC_PREFIX: &str = "docs";
const MAX_ID_LEN: usize = 200;

/// A persisted document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub app_id: String,
    pub doc_id: String,
    pub data: Vec<u8>,
    pub heads: Vec<String>,
    pub change_count: u64,
    pub last_modified: DateTime<Utc>,
}

/// Document summary, without the change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub app_id: String,
    pub doc_id: String,
    pub heads: Vec<String>,
    pub change_count: u64,
    pub last_modified: DateTime<Utc>,
}

impl From<&StoredDocument> for DocumentInfo {
    fn from(stored: &StoredDocument) -> Self {
        Self {
            app_id: stored.app_id.clone(),
            doc_id: stored.doc_id.clone(),
            heads: stored.heads.clone(),
            change_count: stored.change_count,
            last_modified: stored.last_modified,
        }
    }
}

/// Application and document ids become storage path segments
pub fn validate_id(id: &str) -> Result<(), SyncError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(SyncError::InvalidId(id.to_string()))
    }
}

pub struct DocStore {
    backend: Arc<dyn Storage>,
}

impl DocStore {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend }
    }

    fn key(app_id: &str, doc_id: &str) -> Result<String, SyncError> {
        validate_id(app_id)?;
        validate_id(doc_id)?;
        Ok(format!("{}/{}/{}", DOC_PREFIX, app_id, doc_id))
    }

    pub async fn save(&self, app_id: &str, doc_id: &str, doc: &Automerge) -> Result<StoredDocument, SyncError> {
        let key = Self::key(app_id, doc_id)?;
        let stored = StoredDocument {
            app_id: app_id.to_string(),
            doc_id: doc_id.to_string(),
            data: doc.save(),
            heads: encode_heads(&doc.get_heads()),
            change_count: doc.get_changes(&[]).len() as u64,
            last_modified: Utc::now(),
        };
        let bytes = bincode::serialize(&stored)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.backend.put(&key, &bytes).await?;
        debug!(
            "Saved document {}/{} ({} changes)",
            app_id, doc_id, stored.change_count
        );
        Ok(stored)
    }

    pub async fn get(&self, app_id: &str, doc_id: &str) -> Result<Option<StoredDocument>, SyncError> {
        let key = Self::key(app_id, doc_id)?;
        self.get_by_key(&key).await
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<StoredDocument>, SyncError> {
        let bytes = match self.backend.get(key).await {
            Ok(bytes) => bytes,
            Err(StorageError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored = bincode::deserialize(&bytes)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(Some(stored))
    }

    /// Remove a document's change log; `false` if it never existed
    pub async fn delete(&self, app_id: &str, doc_id: &str) -> Result<bool, SyncError> {
        let key = Self::key(app_id, doc_id)?;
        match self.backend.delete(&key).await {
            Ok(()) => {
                debug!("Deleted document {}/{}", app_id, doc_id);
                Ok(true)
            }
            Err(StorageError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// One page of an application's documents, ordered by id, plus the total count
    pub async fn list(
        &self,
        app_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<DocumentInfo>, usize), SyncError> {
        validate_id(app_id)?;
        let mut keys = self
            .backend
            .list(&format!("{}/{}", DOC_PREFIX, app_id))
            .await?;
        keys.sort();

        let total = keys.len();
        let mut page = Vec::new();
        for key in keys.iter().skip(offset).take(limit) {
            if let Some(stored) = self.get_by_key(key).await? {
                page.push(DocumentInfo::from(&stored));
            }
        }
        Ok((page, total))
    }

    /// Every (app, doc) pair currently stored
    pub async fn all_ids(&self) -> Result<Vec<(String, String)>, SyncError> {
        let mut ids = Vec::new();
        for key in self.backend.list(DOC_PREFIX).await? {
            let mut parts = key.splitn(3, '/').skip(1);
            if let (Some(app), Some(doc)) = (parts.next(), parts.next()) {
                ids.push((app.to_string(), doc.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use automerge::transaction::Transactable;

    fn doc_with(key: &str, value: &str) -> Automerge {
        let mut doc = Automerge::new();
        let mut tx = doc.transaction();
        tx.put(automerge::ROOT, key, value).unwrap();
        tx.commit();
        doc
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("app-1").is_ok());
        assert!(validate_id("graph:path.v2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(&"x".repeat(201)).is_err());
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = DocStore::new(Arc::new(MemoryStorage::new()));
        let doc = doc_with("title", "hello");
        let saved = store.save("notes", "n1", &doc).await.unwrap();
        assert_eq!(saved.change_count, 1);
        assert_eq!(saved.heads.len(), 1);

        let loaded = store.get("notes", "n1").await.unwrap().unwrap();
        assert_eq!(loaded.heads, saved.heads);
        assert!(Automerge::load(&loaded.data).is_ok());

        assert!(store.delete("notes", "n1").await.unwrap());
        assert!(!store.delete("notes", "n1").await.unwrap());
        assert!(store.get("notes", "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let store = DocStore::new(Arc::new(MemoryStorage::new()));
        for id in ["c", "a", "b"] {
            store.save("app", id, &doc_with("k", id)).await.unwrap();
        }
        store.save("other", "z", &doc_with("k", "z")).await.unwrap();

        let (page, total) = store.list("app", 1, 1).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].doc_id, "b");

        assert_eq!(store.all_ids().await.unwrap().len(), 4);
    }
}
