//! Content-addressed blob and shard persistence.
//!
//! Layout under the storage root:
//! - `manifests/{digest}.json`: one [`BlobRecord`] per blob
//! - `shards/{xx}/{shard-digest}`: shard bytes, fanned out on the first two hex chars
//! - `held/{shard-digest}`: marker for shards kept on behalf of other nodes
//!
//! Writes are serialised through a single mutex; reads never take it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use super::{JsonStorage, Storage, StorageError, StorageResult};
use crate::crypto::{CryptoUtils, DIGEST_PREFIX};
use crate::types::{BlobRecord, Manifest, Shard};

const MANIFEST_PREFIX: &str = "manifests";
const SHARD_PREFIX: &str = "shards";
const HELD_PREFIX: &str = "held";

/// Marker for a shard this node keeps on behalf of another node
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeldShard {
    shard_digest: String,
    size: u64,
    received_at: DateTime<Utc>,
    /// Node that placed the shard; only it may release it
    #[serde(default)]
    placed_by: Option<String>,
}

#[derive(Debug, Default)]
struct Slot {
    readers: usize,
    exclusive: bool,
    /// Writers queued for the blob; new readers wait behind them
    writers_waiting: usize,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.readers == 0 && !self.exclusive && self.writers_waiting == 0
    }
}

type Slots = Arc<DashMap<String, Slot>>;

/// Tracks in-flight reads per blob so eviction and deletion never remove
/// shards a reader is still using. A queued writer blocks new readers, so a
/// steady stream of reads cannot starve it.
#[derive(Debug, Clone, Default)]
pub struct ReaderRegistry {
    slots: Slots,
    released: Arc<Notify>,
}

/// Held by a reader for the duration of a serve
#[derive(Debug)]
pub struct ReadGuard {
    digest: String,
    slots: Slots,
    released: Arc<Notify>,
}

/// Held by the evictor or a delete while it removes a blob's shards
#[derive(Debug)]
pub struct ExclusiveGuard {
    digest: String,
    slots: Slots,
    released: Arc<Notify>,
}

/// Withdraws a writer's place in the queue, including when its wait is cancelled
struct QueuedWriter<'a> {
    digest: &'a str,
    registry: &'a ReaderRegistry,
}

impl Drop for QueuedWriter<'_> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.registry.slots.get_mut(self.digest) {
            slot.writers_waiting = slot.writers_waiting.saturating_sub(1);
        }
        self.registry.release(self.digest);
    }
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn release(&self, digest: &str) {
        release_slot(&self.slots, &self.released, digest);
    }

    /// Register a reader, waiting out any eviction or delete holding or
    /// queued for the blob
    pub async fn acquire(&self, digest: &str) -> ReadGuard {
        loop {
            // Registered before the check so a release in between is not missed
            let released = self.released.notified();
            {
                let mut slot = self.slots.entry(digest.to_string()).or_default();
                if !slot.exclusive && slot.writers_waiting == 0 {
                    slot.readers += 1;
                    return ReadGuard {
                        digest: digest.to_string(),
                        slots: Arc::clone(&self.slots),
                        released: Arc::clone(&self.released),
                    };
                }
            }
            released.await;
        }
    }

    /// Claim the blob for removal, waiting for active readers to finish
    pub async fn exclusive(&self, digest: &str) -> ExclusiveGuard {
        let mut queued = None;
        loop {
            let released = self.released.notified();
            {
                let mut slot = self.slots.entry(digest.to_string()).or_default();
                if !slot.exclusive && slot.readers == 0 {
                    slot.exclusive = true;
                    break;
                }
                if queued.is_none() {
                    slot.writers_waiting += 1;
                    queued = Some(QueuedWriter {
                        digest,
                        registry: self,
                    });
                }
            }
            released.await;
        }
        drop(queued);
        ExclusiveGuard {
            digest: digest.to_string(),
            slots: Arc::clone(&self.slots),
            released: Arc::clone(&self.released),
        }
    }

    /// Claim the blob for removal; `None` while any reader is active
    pub fn try_exclusive(&self, digest: &str) -> Option<ExclusiveGuard> {
        let mut slot = self.slots.entry(digest.to_string()).or_default();
        if slot.exclusive || slot.readers != 0 {
            return None;
        }
        slot.exclusive = true;
        Some(ExclusiveGuard {
            digest: digest.to_string(),
            slots: Arc::clone(&self.slots),
            released: Arc::clone(&self.released),
        })
    }

    pub fn active_readers(&self, digest: &str) -> usize {
        self.slots.get(digest).map(|slot| slot.readers).unwrap_or(0)
    }

    /// Blobs with any reader, writer or queued writer
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }
}

fn release_slot(slots: &DashMap<String, Slot>, released: &Notify, digest: &str) {
    slots.remove_if(digest, |_, slot| slot.is_idle());
    released.notify_waiters();
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slots.get_mut(&self.digest) {
            slot.readers = slot.readers.saturating_sub(1);
        }
        release_slot(&self.slots, &self.released, &self.digest);
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slots.get_mut(&self.digest) {
            slot.exclusive = false;
        }
        release_slot(&self.slots, &self.released, &self.digest);
    }
}

/// Content-addressed blob store over any [`Storage`] backend
pub struct ContentStore {
    backend: Arc<dyn Storage>,
    records: RwLock<HashMap<String, BlobRecord>>,
    /// Number of local holders (blob shard slots plus held markers) per shard file
    shard_refs: RwLock<HashMap<String, (usize, u64)>>,
    /// Shards kept for other nodes
    held: RwLock<HashMap<String, HeldShard>>,
    used_bytes: AtomicU64,
    write_lock: Mutex<()>,
    readers: ReaderRegistry,
}

fn manifest_key(digest: &str) -> String {
    format!("{}/{}.json", MANIFEST_PREFIX, digest)
}

fn held_key(shard_digest: &str) -> String {
    format!("{}/{}", HELD_PREFIX, shard_digest)
}

/// Storage key for a shard file; `None` for anything that is not a content address
pub fn shard_key(shard_digest: &str) -> Option<String> {
    if !CryptoUtils::is_valid_digest(shard_digest) {
        return None;
    }
    let hex_part = &shard_digest[DIGEST_PREFIX.len()..];
    Some(format!("{}/{}/{}", SHARD_PREFIX, &hex_part[..2], shard_digest))
}

fn checked_shard_key(shard_digest: &str) -> StorageResult<String> {
    shard_key(shard_digest).ok_or_else(|| StorageError::InvalidKey(shard_digest.to_string()))
}

impl ContentStore {
    /// Open the store and rebuild the in-memory index from the backend
    pub async fn open(backend: Arc<dyn Storage>) -> StorageResult<Self> {
        let store = Self {
            backend,
            records: RwLock::new(HashMap::new()),
            shard_refs: RwLock::new(HashMap::new()),
            held: RwLock::new(HashMap::new()),
            used_bytes: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            readers: ReaderRegistry::new(),
        };
        store.rebuild().await?;
        Ok(store)
    }

    async fn rebuild(&self) -> StorageResult<()> {
        let mut records = HashMap::new();
        let mut refs: HashMap<String, (usize, u64)> = HashMap::new();

        for key in self.backend.list(MANIFEST_PREFIX).await? {
            let mut record: BlobRecord = match self.backend.get_json(&key).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable manifest {}: {}", key, e);
                    continue;
                }
            };

            let mut present = BTreeSet::new();
            for index in &record.local_shards {
                let Some(shard_digest) = record.manifest.shard_digests.get(*index) else {
                    continue;
                };
                if self.backend.exists(&checked_shard_key(shard_digest)?).await? {
                    present.insert(*index);
                    let entry = refs
                        .entry(shard_digest.clone())
                        .or_insert((0, record.manifest.shard_size));
                    entry.0 += 1;
                } else {
                    warn!(
                        "Shard {} of {} missing from disk",
                        index,
                        record.manifest.digest
                    );
                }
            }
            if present != record.local_shards {
                record.local_shards = present;
                self.backend
                    .put_json(&manifest_key(&record.manifest.digest), &record)
                    .await?;
            }
            records.insert(record.manifest.digest.clone(), record);
        }

        let mut held = HashMap::new();
        for key in self.backend.list(HELD_PREFIX).await? {
            let marker: HeldShard = match self.backend.get_json(&key).await {
                Ok(marker) => marker,
                Err(e) => {
                    warn!("Skipping unreadable held marker {}: {}", key, e);
                    continue;
                }
            };
            let entry = refs
                .entry(marker.shard_digest.clone())
                .or_insert((0, marker.size));
            entry.0 += 1;
            held.insert(marker.shard_digest.clone(), marker);
        }

        let used: u64 = refs.values().map(|(_, size)| *size).sum();
        info!(
            "Content store loaded {} blobs, {} held shards, {} bytes",
            records.len(),
            held.len(),
            used
        );

        *self.records.write().await = records;
        *self.shard_refs.write().await = refs;
        *self.held.write().await = held;
        self.used_bytes.store(used, Ordering::SeqCst);
        Ok(())
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, digest: &str) -> bool {
        self.records.read().await.contains_key(digest)
    }

    pub async fn record(&self, digest: &str) -> Option<BlobRecord> {
        self.records.read().await.get(digest).cloned()
    }

    pub async fn manifest(&self, digest: &str) -> Option<Manifest> {
        self.records
            .read()
            .await
            .get(digest)
            .map(|r| r.manifest.clone())
    }

    pub async fn records(&self) -> Vec<BlobRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// The local blob a shard belongs to, if any
    pub async fn owning_blob(&self, shard_digest: &str) -> Option<BlobRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.manifest.shard_digests.iter().any(|d| d == shard_digest))
            .cloned()
    }

    pub async fn blob_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn degraded(&self) -> Vec<String> {
        let mut digests: Vec<String> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.degraded)
            .map(|r| r.manifest.digest.clone())
            .collect();
        digests.sort();
        digests
    }

    /// Add a reference to a shard file, writing it if this is the first one
    async fn retain_shard(&self, shard_digest: &str, bytes: &[u8]) -> StorageResult<()> {
        let mut refs = self.shard_refs.write().await;
        match refs.get_mut(shard_digest) {
            Some(entry) => entry.0 += 1,
            None => {
                self.backend
                    .put(&checked_shard_key(shard_digest)?, bytes)
                    .await?;
                refs.insert(shard_digest.to_string(), (1, bytes.len() as u64));
                self.used_bytes
                    .fetch_add(bytes.len() as u64, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Drop a reference, deleting the file with the last one. Returns freed bytes.
    async fn release_shard(&self, shard_digest: &str) -> StorageResult<u64> {
        let mut refs = self.shard_refs.write().await;
        let remaining = match refs.get_mut(shard_digest) {
            Some(entry) => {
                entry.0 = entry.0.saturating_sub(1);
                entry.0
            }
            None => return Ok(0),
        };
        if remaining > 0 {
            return Ok(0);
        }
        let size = refs.remove(shard_digest).map(|(_, size)| size).unwrap_or(0);
        match self.backend.delete(&checked_shard_key(shard_digest)?).await {
            Ok(()) | Err(StorageError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.used_bytes.fetch_sub(size, Ordering::SeqCst);
        Ok(size)
    }

    /// Persist a new blob: the shards listed in `record.local_shards` followed by the manifest
    pub async fn write_blob(&self, record: BlobRecord, shards: &[Shard]) -> StorageResult<()> {
        let _write = self.write_lock.lock().await;
        let digest = record.manifest.digest.clone();

        for shard in shards {
            if !record.local_shards.contains(&shard.index) {
                continue;
            }
            if !shard.verify() {
                return Err(StorageError::Integrity(shard.digest.clone()));
            }
            self.retain_shard(&shard.digest, &shard.bytes).await?;
        }

        self.backend.put_json(&manifest_key(&digest), &record).await?;
        debug!(
            "Stored blob {} with {} local shards",
            digest,
            record.local_shards.len()
        );
        self.records.write().await.insert(digest, record);
        Ok(())
    }

    /// Apply `update` to a blob's record and persist the result
    pub async fn update_record<F>(&self, digest: &str, update: F) -> StorageResult<BlobRecord>
    where
        F: FnOnce(&mut BlobRecord),
    {
        let _write = self.write_lock.lock().await;
        let mut record = self
            .record(digest)
            .await
            .ok_or_else(|| StorageError::KeyNotFound(digest.to_string()))?;
        update(&mut record);
        self.backend.put_json(&manifest_key(digest), &record).await?;
        self.records
            .write()
            .await
            .insert(digest.to_string(), record.clone());
        Ok(record)
    }

    pub async fn touch(&self, digest: &str) -> StorageResult<()> {
        self.update_record(digest, |r| r.last_accessed = Utc::now())
            .await
            .map(|_| ())
    }

    pub async fn set_degraded(&self, digest: &str, degraded: bool) -> StorageResult<()> {
        self.update_record(digest, |r| r.degraded = degraded)
            .await
            .map(|_| ())
    }

    pub async fn set_retain(&self, digest: &str, retain: bool) -> StorageResult<()> {
        self.update_record(digest, |r| r.retain = retain)
            .await
            .map(|_| ())
    }

    /// Read a blob's local shard without verifying it
    pub async fn read_local_shard(&self, record: &BlobRecord, index: usize) -> StorageResult<Shard> {
        let shard_digest = record
            .manifest
            .shard_digests
            .get(index)
            .ok_or_else(|| StorageError::KeyNotFound(format!("{}#{}", record.digest(), index)))?;
        let bytes = self.backend.get(&checked_shard_key(shard_digest)?).await?;
        Ok(Shard {
            index,
            digest: shard_digest.clone(),
            bytes,
        })
    }

    /// Read any shard file this node holds, by shard digest
    pub async fn read_shard(&self, shard_digest: &str) -> StorageResult<Vec<u8>> {
        if !self.has_shard(shard_digest).await {
            return Err(StorageError::KeyNotFound(shard_digest.to_string()));
        }
        self.backend.get(&checked_shard_key(shard_digest)?).await
    }

    pub async fn has_shard(&self, shard_digest: &str) -> bool {
        self.shard_refs.read().await.contains_key(shard_digest)
    }

    /// Rewrite a shard file after repair
    pub async fn replace_shard(&self, shard: &Shard) -> StorageResult<()> {
        if !shard.verify() {
            return Err(StorageError::Integrity(shard.digest.clone()));
        }
        let _write = self.write_lock.lock().await;
        self.backend
            .put(&checked_shard_key(&shard.digest)?, &shard.bytes)
            .await
    }

    /// Add shards to an existing blob's local set
    pub async fn add_local_shards(&self, digest: &str, shards: &[Shard]) -> StorageResult<()> {
        let record = self
            .record(digest)
            .await
            .ok_or_else(|| StorageError::KeyNotFound(digest.to_string()))?;
        let mut added = Vec::new();
        {
            let _write = self.write_lock.lock().await;
            for shard in shards {
                if record.local_shards.contains(&shard.index) || added.contains(&shard.index) {
                    continue;
                }
                if record.manifest.shard_digests.get(shard.index) != Some(&shard.digest)
                    || !shard.verify()
                {
                    return Err(StorageError::Integrity(shard.digest.clone()));
                }
                self.retain_shard(&shard.digest, &shard.bytes).await?;
                added.push(shard.index);
            }
        }
        self.update_record(digest, |r| r.local_shards.extend(added))
            .await
            .map(|_| ())
    }

    /// Drop the given local shards of a blob, keeping its manifest. Returns freed bytes.
    pub async fn remove_local_shards(&self, digest: &str, indices: &[usize]) -> StorageResult<u64> {
        let record = self
            .record(digest)
            .await
            .ok_or_else(|| StorageError::KeyNotFound(digest.to_string()))?;

        let mut freed = 0;
        let mut removed = Vec::new();
        {
            let _write = self.write_lock.lock().await;
            for index in indices {
                if !record.local_shards.contains(index) {
                    continue;
                }
                if let Some(shard_digest) = record.manifest.shard_digests.get(*index) {
                    freed += self.release_shard(shard_digest).await?;
                    removed.push(*index);
                }
            }
        }

        self.update_record(digest, |r| {
            for index in &removed {
                r.local_shards.remove(index);
            }
        })
        .await?;
        Ok(freed)
    }

    /// Remove a blob entirely: local shards and manifest
    pub async fn delete_blob(&self, digest: &str) -> StorageResult<u64> {
        let record = self
            .record(digest)
            .await
            .ok_or_else(|| StorageError::KeyNotFound(digest.to_string()))?;

        let _write = self.write_lock.lock().await;
        let mut freed = 0;
        for index in &record.local_shards {
            if let Some(shard_digest) = record.manifest.shard_digests.get(*index) {
                freed += self.release_shard(shard_digest).await?;
            }
        }
        match self.backend.delete(&manifest_key(digest)).await {
            Ok(()) | Err(StorageError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.records.write().await.remove(digest);
        info!("Deleted blob {} ({} bytes freed)", digest, freed);
        Ok(freed)
    }

    /// Keep a shard on behalf of another node. The bytes must hash to `shard_digest`.
    pub async fn store_held_shard(
        &self,
        shard_digest: &str,
        bytes: &[u8],
        placed_by: Option<&str>,
    ) -> StorageResult<()> {
        if !CryptoUtils::verify_content_hash(bytes, shard_digest) {
            return Err(StorageError::Integrity(shard_digest.to_string()));
        }
        let _write = self.write_lock.lock().await;
        if self.held.read().await.contains_key(shard_digest) {
            return Ok(());
        }
        self.retain_shard(shard_digest, bytes).await?;
        let marker = HeldShard {
            shard_digest: shard_digest.to_string(),
            size: bytes.len() as u64,
            received_at: Utc::now(),
            placed_by: placed_by.map(str::to_string),
        };
        self.backend.put_json(&held_key(shard_digest), &marker).await?;
        self.held.write().await.insert(shard_digest.to_string(), marker);
        debug!("Holding shard {} for a peer", shard_digest);
        Ok(())
    }

    /// Stop holding a shard for another node. Returns freed bytes, zero when
    /// the file is still used by a local blob or was never held.
    pub async fn release_held_shard(&self, shard_digest: &str) -> StorageResult<u64> {
        let _write = self.write_lock.lock().await;
        if self.held.write().await.remove(shard_digest).is_none() {
            return Ok(0);
        }
        let freed = self.release_shard(shard_digest).await?;
        match self.backend.delete(&held_key(shard_digest)).await {
            Ok(()) | Err(StorageError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!("Released held shard {} ({} bytes)", shard_digest, freed);
        Ok(freed)
    }

    pub async fn is_held(&self, shard_digest: &str) -> bool {
        self.held.read().await.contains_key(shard_digest)
    }

    /// The node a held shard was placed by; `None` if unknown or not held
    pub async fn held_for(&self, shard_digest: &str) -> Option<String> {
        self.held
            .read()
            .await
            .get(shard_digest)
            .and_then(|marker| marker.placed_by.clone())
    }

    /// Held shard digests, oldest arrival first
    pub async fn held_shards(&self) -> Vec<String> {
        let held = self.held.read().await;
        let mut entries: Vec<(&DateTime<Utc>, &String)> = held
            .iter()
            .map(|(digest, marker)| (&marker.received_at, digest))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, digest)| digest.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionMetadata;
    use crate::erasure::{encode, ErasureParams};
    use crate::storage::{FileStorage, MemoryStorage};
    use crate::types::ReachLevel;
    use std::time::Duration;
    use tempfile::tempdir;

    fn varied(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn blob(data: &[u8]) -> (BlobRecord, Vec<Shard>) {
        let shards = encode(data, ErasureParams::default()).unwrap();
        let now = Utc::now();
        let record = BlobRecord {
            manifest: Manifest {
                digest: CryptoUtils::content_hash(data),
                size: data.len() as u64,
                encoded_size: data.len() as u64,
                shard_size: shards[0].bytes.len() as u64,
                shard_digests: shards.iter().map(|s| s.digest.clone()).collect(),
                k: 4,
                m: 3,
                encryption: EncryptionMetadata::cleartext(),
            },
            mime_type: "application/octet-stream".to_string(),
            reach: ReachLevel::Commons,
            owner: "alice".to_string(),
            beneficiary: None,
            invited: BTreeSet::new(),
            created_at: now,
            last_accessed: now,
            local_shards: (0..shards.len()).collect(),
            retain: false,
            degraded: false,
        };
        (record, shards)
    }

    #[test]
    fn test_shard_key_fan_out() {
        let digest = CryptoUtils::content_hash(b"x");
        let key = shard_key(&digest).unwrap();
        assert!(key.starts_with(&format!("shards/{}/", &digest[7..9])));
        assert!(shard_key("sha256-../../evil").is_none());
    }

    #[tokio::test]
    async fn test_write_and_reopen() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());
        let (record, shards) = blob(&varied(1000));
        let digest = record.manifest.digest.clone();

        {
            let store = ContentStore::open(Arc::clone(&backend)).await.unwrap();
            store.write_blob(record, &shards).await.unwrap();
            assert_eq!(store.used_bytes(), 7 * 250);
        }

        let store = ContentStore::open(backend).await.unwrap();
        let record = store.record(&digest).await.unwrap();
        assert_eq!(record.local_shards.len(), 7);
        assert_eq!(store.used_bytes(), 7 * 250);
        let shard = store.read_local_shard(&record, 5).await.unwrap();
        assert!(shard.verify());
    }

    #[tokio::test]
    async fn test_remove_local_shards_frees_space() {
        let store = ContentStore::open(Arc::new(MemoryStorage::new())).await.unwrap();
        let (record, shards) = blob(b"some content that is long enough to shard");
        let digest = record.manifest.digest.clone();
        store.write_blob(record, &shards).await.unwrap();
        let before = store.used_bytes();

        let freed = store.remove_local_shards(&digest, &[0, 1, 2]).await.unwrap();
        assert!(freed > 0);
        assert_eq!(store.used_bytes(), before - freed);
        let record = store.record(&digest).await.unwrap();
        assert_eq!(record.local_shards, [3, 4, 5, 6].into_iter().collect());

        // Fetched copies can be taken back in, but only if they match the manifest
        store.add_local_shards(&digest, &shards[..1]).await.unwrap();
        assert!(store.record(&digest).await.unwrap().local_shards.contains(&0));
        let mut forged = shards[1].clone();
        forged.index = 2;
        assert!(store.add_local_shards(&digest, &[forged]).await.is_err());

        store.delete_blob(&digest).await.unwrap();
        assert!(!store.contains(&digest).await);
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_held_shards_share_files() {
        let store = ContentStore::open(Arc::new(MemoryStorage::new())).await.unwrap();
        let (record, shards) = blob(&varied(64));
        let digest = record.manifest.digest.clone();
        store.write_blob(record, &shards).await.unwrap();
        let before = store.used_bytes();

        // Same bytes held for a peer do not take extra space
        store
            .store_held_shard(&shards[0].digest, &shards[0].bytes, Some("node-b"))
            .await
            .unwrap();
        assert_eq!(store.used_bytes(), before);

        store.delete_blob(&digest).await.unwrap();
        assert!(store.has_shard(&shards[0].digest).await);
        assert_eq!(
            store.read_shard(&shards[0].digest).await.unwrap(),
            shards[0].bytes
        );

        assert!(store
            .store_held_shard(&shards[1].digest, b"wrong", None)
            .await
            .is_err());
        assert_eq!(store.held_for(&shards[0].digest).await.as_deref(), Some("node-b"));
        assert_eq!(store.held_shards().await, vec![shards[0].digest.clone()]);

        assert_eq!(
            store.release_held_shard(&shards[0].digest).await.unwrap(),
            shards[0].bytes.len() as u64
        );
        assert_eq!(store.release_held_shard(&shards[0].digest).await.unwrap(), 0);
        assert!(store.held_shards().await.is_empty());
        assert!(!store.has_shard(&shards[0].digest).await);
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_held_shards_oldest_first_and_reloaded() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = ContentStore::open(Arc::clone(&backend)).await.unwrap();
        let mut digests = Vec::new();
        for seed in 0..3u8 {
            let bytes = vec![seed; 100];
            let digest = CryptoUtils::content_hash(&bytes);
            store.store_held_shard(&digest, &bytes, None).await.unwrap();
            digests.push(digest);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.held_shards().await, digests);
        assert_eq!(store.used_bytes(), 300);

        let reopened = ContentStore::open(backend).await.unwrap();
        assert_eq!(reopened.held_shards().await, digests);
        assert!(reopened.is_held(&digests[1]).await);
        assert_eq!(reopened.used_bytes(), 300);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_readers() {
        let registry = ReaderRegistry::new();
        let guard = registry.acquire("blob").await;
        assert!(registry.try_exclusive("blob").is_none());
        drop(guard);

        let exclusive = registry.try_exclusive("blob").unwrap();
        let reg = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = reg.acquire("blob").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(exclusive);
        waiter.await.unwrap();
        assert_eq!(registry.active_readers("blob"), 0);
    }

    #[tokio::test]
    async fn test_queued_writer_is_not_starved() {
        let registry = ReaderRegistry::new();
        let first = registry.acquire("blob").await;

        let reg = registry.clone();
        let writer = tokio::spawn(async move {
            let _exclusive = reg.exclusive("blob").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        // Readers arriving behind the writer queue up instead of overlapping
        let reg = registry.clone();
        let late_reader = tokio::spawn(async move {
            let _g = reg.acquire("blob").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!late_reader.is_finished());
        assert_eq!(registry.active_readers("blob"), 1);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late_reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.tracked(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_writer_leaves_no_queue() {
        let registry = ReaderRegistry::new();
        let reader = registry.acquire("blob").await;
        let waited =
            tokio::time::timeout(Duration::from_millis(10), registry.exclusive("blob")).await;
        assert!(waited.is_err());

        // The abandoned writer no longer holds readers back
        let second = tokio::time::timeout(Duration::from_millis(100), registry.acquire("blob"))
            .await
            .unwrap();
        assert_eq!(registry.active_readers("blob"), 2);
        drop(reader);
        drop(second);
        assert_eq!(registry.tracked(), 0);
    }
}
