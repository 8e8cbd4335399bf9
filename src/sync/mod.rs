//! Document sync engine.
//!
//! Peers exchange heads, request the change-set they are missing, and apply
//! it with automerge's merge. Applying a change twice is a no-op, so any
//! arrival order converges to the same document.

pub mod doc_store;

pub use doc_store::{validate_id, DocStore, DocumentInfo, StoredDocument};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use automerge::{Automerge, ChangeHash, ReadDoc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributed::PEER_ID_HEADER;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid change data: {0}")]
    InvalidChange(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Peer error: {0}")]
    Peer(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Changes one side is missing, plus the sender's heads after them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Hex-encoded automerge change chunks
    pub changes: Vec<String>,
    pub heads: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn decode(&self) -> SyncResult<Vec<Vec<u8>>> {
        self.changes
            .iter()
            .map(|c| hex::decode(c).map_err(|e| SyncError::InvalidChange(e.to_string())))
            .collect()
    }
}

/// What one exchange with a peer moved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pulled: bool,
    pub pushed: bool,
    pub heads: Vec<String>,
}

pub fn encode_heads(heads: &[ChangeHash]) -> Vec<String> {
    let mut encoded: Vec<String> = heads.iter().map(|h| hex::encode(h.0)).collect();
    encoded.sort();
    encoded
}

/// Parse hex heads, dropping anything that is not a 32-byte hash
pub fn decode_heads(heads: &[String]) -> Vec<ChangeHash> {
    heads
        .iter()
        .filter_map(|h| {
            let bytes = hex::decode(h).ok()?;
            let arr: [u8; 32] = bytes.try_into().ok()?;
            Some(ChangeHash(arr))
        })
        .collect()
}

/// The far side of a document exchange
#[async_trait]
pub trait DocPeer: Send + Sync {
    /// Human-readable peer name for logs
    fn name(&self) -> String;

    /// Current heads; empty if the peer has never seen the document
    async fn heads(&self, app_id: &str, doc_id: &str) -> SyncResult<Vec<String>>;

    async fn changes_since(&self, app_id: &str, doc_id: &str, have: &[String]) -> SyncResult<ChangeSet>;

    /// Deliver changes; returns the peer's heads after applying them
    async fn push_changes(&self, app_id: &str, doc_id: &str, changes: &ChangeSet) -> SyncResult<Vec<String>>;
}

pub struct SyncEngine {
    docs: DocStore,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self {
            docs: DocStore::new(backend),
            doc_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &DocStore {
        &self.docs
    }

    fn doc_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.doc_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_doc_lock(&self, key: &str) {
        // Only the map itself still holds the lock once every writer is done
        self.doc_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, app_id: &str, doc_id: &str) -> SyncResult<Option<Automerge>> {
        match self.docs.get(app_id, doc_id).await? {
            Some(stored) => Automerge::load(&stored.data)
                .map(Some)
                .map_err(|e| SyncError::Document(e.to_string())),
            None => Ok(None),
        }
    }

    async fn load_existing(&self, app_id: &str, doc_id: &str) -> SyncResult<Automerge> {
        self.load(app_id, doc_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", app_id, doc_id)))
    }

    pub async fn heads(&self, app_id: &str, doc_id: &str) -> SyncResult<Vec<String>> {
        let doc = self.load_existing(app_id, doc_id).await?;
        Ok(encode_heads(&doc.get_heads()))
    }

    /// Changes not covered by `have`. Heads this node has never seen are
    /// ignored, so a diverged peer receives everything it could be missing.
    pub async fn changes_since(&self, app_id: &str, doc_id: &str, have: &[String]) -> SyncResult<ChangeSet> {
        let doc = self.load_existing(app_id, doc_id).await?;
        let known: Vec<ChangeHash> = decode_heads(have)
            .into_iter()
            .filter(|h| doc.get_change_by_hash(h).is_some())
            .collect();

        let chunk = doc.save_after(&known);
        let changes = if chunk.is_empty() || doc.get_heads().iter().all(|h| known.contains(h)) {
            Vec::new()
        } else {
            vec![hex::encode(chunk)]
        };
        Ok(ChangeSet {
            changes,
            heads: encode_heads(&doc.get_heads()),
        })
    }

    /// Heads from `theirs` that this node does not have
    pub async fn missing_heads(&self, app_id: &str, doc_id: &str, theirs: &[String]) -> SyncResult<Vec<String>> {
        let doc = self.load(app_id, doc_id).await?;
        let missing = decode_heads(theirs)
            .into_iter()
            .filter(|h| match &doc {
                Some(doc) => doc.get_change_by_hash(h).is_none(),
                None => true,
            })
            .collect::<Vec<_>>();
        Ok(encode_heads(&missing))
    }

    /// Merge a change-set, creating the document on its first change.
    /// Returns the resulting heads.
    pub async fn apply_changes(&self, app_id: &str, doc_id: &str, changes: &ChangeSet) -> SyncResult<Vec<String>> {
        validate_id(app_id)?;
        validate_id(doc_id)?;
        let chunks = changes.decode()?;

        let key = format!("{}/{}", app_id, doc_id);
        let lock = self.doc_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(app_id, doc_id, &chunks).await
        };
        drop(lock);
        self.release_doc_lock(&key);
        result
    }

    async fn apply_locked(&self, app_id: &str, doc_id: &str, chunks: &[Vec<u8>]) -> SyncResult<Vec<String>> {
        let existing = self.load(app_id, doc_id).await?;
        if existing.is_none() && chunks.is_empty() {
            return Err(SyncError::NotFound(format!("{}/{}", app_id, doc_id)));
        }
        let created = existing.is_none();
        let mut doc = existing.unwrap_or_else(Automerge::new);
        let before = doc.get_heads();

        let mut applied = 0;
        for chunk in chunks {
            applied += doc
                .load_incremental(chunk)
                .map_err(|e| SyncError::InvalidChange(e.to_string()))?;
        }

        let after = doc.get_heads();
        if created || before != after {
            self.docs.save(app_id, doc_id, &doc).await?;
        }
        debug!(
            "Applied {} changes to {}/{}; {} heads",
            applied,
            app_id,
            doc_id,
            after.len()
        );
        Ok(encode_heads(&after))
    }

    pub async fn info(&self, app_id: &str, doc_id: &str) -> SyncResult<DocumentInfo> {
        self.docs
            .get(app_id, doc_id)
            .await?
            .map(|stored| DocumentInfo::from(&stored))
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", app_id, doc_id)))
    }

    pub async fn list(&self, app_id: &str, offset: usize, limit: usize) -> SyncResult<(Vec<DocumentInfo>, usize)> {
        self.docs.list(app_id, offset, limit).await
    }

    /// Tombstone a document by dropping its change log
    pub async fn delete(&self, app_id: &str, doc_id: &str) -> SyncResult<()> {
        let key = format!("{}/{}", app_id, doc_id);
        let lock = self.doc_lock(&key);
        let deleted = {
            let _guard = lock.lock().await;
            self.docs.delete(app_id, doc_id).await
        };
        drop(lock);
        self.release_doc_lock(&key);
        if deleted? {
            info!("Document {}/{} deleted", app_id, doc_id);
            Ok(())
        } else {
            Err(SyncError::NotFound(format!("{}/{}", app_id, doc_id)))
        }
    }

    /// One heads exchange with `peer`: pull what we lack, push what it lacks
    pub async fn sync_with_peer(&self, app_id: &str, doc_id: &str, peer: &dyn DocPeer) -> SyncResult<SyncOutcome> {
        let local_heads = match self.heads(app_id, doc_id).await {
            Ok(heads) => heads,
            Err(SyncError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let remote_heads = match peer.heads(app_id, doc_id).await {
            Ok(heads) => heads,
            Err(SyncError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut outcome = SyncOutcome::default();

        if !self.missing_heads(app_id, doc_id, &remote_heads).await?.is_empty() {
            let incoming = peer.changes_since(app_id, doc_id, &local_heads).await?;
            if !incoming.is_empty() {
                self.apply_changes(app_id, doc_id, &incoming).await?;
                outcome.pulled = true;
            }
        }

        if !local_heads.is_empty() {
            let outgoing = self.changes_since(app_id, doc_id, &remote_heads).await?;
            if !outgoing.is_empty() {
                peer.push_changes(app_id, doc_id, &outgoing).await?;
                outcome.pushed = true;
            }
        }

        outcome.heads = match self.heads(app_id, doc_id).await {
            Ok(heads) => heads,
            Err(SyncError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        if outcome.pulled || outcome.pushed {
            debug!(
                "Synced {}/{} with {} (pulled: {}, pushed: {})",
                app_id,
                doc_id,
                peer.name(),
                outcome.pulled,
                outcome.pushed
            );
        }
        Ok(outcome)
    }

    /// Sync every stored document with every peer on a fixed interval
    pub fn spawn_sync_loop(
        self: Arc<Self>,
        peers: Vec<Arc<dyn DocPeer>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let ids = match self.docs.all_ids().await {
                            Ok(ids) => ids,
                            Err(e) => {
                                warn!("Listing documents for sync failed: {}", e);
                                continue;
                            }
                        };
                        for (app_id, doc_id) in &ids {
                            for peer in &peers {
                                if let Err(e) = self.sync_with_peer(app_id, doc_id, peer.as_ref()).await {
                                    warn!("Sync of {}/{} with {} failed: {}", app_id, doc_id, peer.name(), e);
                                }
                            }
                        }
                    }
                }
            }
            debug!("Document sync loop stopped");
        })
    }
}

/// An engine in the same process acts as its own peer
#[async_trait]
impl DocPeer for SyncEngine {
    fn name(&self) -> String {
        "local".to_string()
    }

    async fn heads(&self, app_id: &str, doc_id: &str) -> SyncResult<Vec<String>> {
        SyncEngine::heads(self, app_id, doc_id).await
    }

    async fn changes_since(&self, app_id: &str, doc_id: &str, have: &[String]) -> SyncResult<ChangeSet> {
        SyncEngine::changes_since(self, app_id, doc_id, have).await
    }

    async fn push_changes(&self, app_id: &str, doc_id: &str, changes: &ChangeSet) -> SyncResult<Vec<String>> {
        self.apply_changes(app_id, doc_id, changes).await
    }
}

#[derive(Debug, Deserialize)]
struct HeadsResponse {
    heads: Vec<String>,
}

/// Peer reached through its HTTP document endpoints
pub struct HttpDocPeer {
    node_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpDocPeer {
    pub fn new(
        node_id: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            node_id: node_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn doc_url(&self, app_id: &str, doc_id: &str, tail: &str) -> String {
        format!("{}/docs/{}/{}/{}", self.base_url, app_id, doc_id, tail)
    }

    async fn check(response: reqwest::Response, what: &str) -> SyncResult<reqwest::Response> {
        match response.status() {
            s if s.is_success() => Ok(response),
            reqwest::StatusCode::NOT_FOUND => Err(SyncError::NotFound(what.to_string())),
            s => Err(SyncError::Peer(format!("{} returned {}", what, s))),
        }
    }
}

fn peer_error(e: reqwest::Error) -> SyncError {
    SyncError::Peer(e.to_string())
}

#[async_trait]
impl DocPeer for HttpDocPeer {
    fn name(&self) -> String {
        self.base_url.clone()
    }

    async fn heads(&self, app_id: &str, doc_id: &str) -> SyncResult<Vec<String>> {
        let response = self
            .client
            .get(&self.doc_url(app_id, doc_id, "heads"))
            .header(PEER_ID_HEADER, &self.node_id)
            .send()
            .await
            .map_err(peer_error)?;
        let body: HeadsResponse = Self::check(response, doc_id)
            .await?
            .json()
            .await
            .map_err(peer_error)?;
        Ok(body.heads)
    }

    async fn changes_since(&self, app_id: &str, doc_id: &str, have: &[String]) -> SyncResult<ChangeSet> {
        let response = self
            .client
            .get(&self.doc_url(app_id, doc_id, "changes"))
            .header(PEER_ID_HEADER, &self.node_id)
            .query(&[("have", have.join(","))])
            .send()
            .await
            .map_err(peer_error)?;
        Self::check(response, doc_id)
            .await?
            .json()
            .await
            .map_err(peer_error)
    }

    async fn push_changes(&self, app_id: &str, doc_id: &str, changes: &ChangeSet) -> SyncResult<Vec<String>> {
        let response = self
            .client
            .post(&self.doc_url(app_id, doc_id, "changes"))
            .header(PEER_ID_HEADER, &self.node_id)
            .json(changes)
            .send()
            .await
            .map_err(peer_error)?;
        let body: HeadsResponse = Self::check(response, doc_id)
            .await?
            .json()
            .await
            .map_err(peer_error)?;
        Ok(body.heads)
    }
}
