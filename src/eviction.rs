//! Storage budget enforcement: once usage crosses the high-water mark,
//! release shards held for other nodes (oldest first), then evict
//! widest-reach, least recently used blobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributed::{CustodianTable, ReplicationManager};
use crate::policy::ReachPolicy;
use crate::storage::{ContentStore, StorageResult};
use crate::types::BlobRecord;

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub high_water_bytes: u64,
    pub low_water_bytes: u64,
    pub interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: 10 * 1024 * 1024 * 1024,
            low_water_bytes: 8 * 1024 * 1024 * 1024,
            interval: Duration::from_secs(60),
        }
    }
}

/// What one eviction pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Shards held for other nodes that were let go
    pub released_held: Vec<String>,
    pub evicted: Vec<String>,
    /// Candidates passed over because a reader held them
    pub skipped_active: Vec<String>,
    pub freed_bytes: u64,
    pub used_after: u64,
}

pub struct EvictionManager {
    store: Arc<ContentStore>,
    custodians: Arc<CustodianTable>,
    /// Retracts custodian copies of blobs dropped whole
    replication: Option<Arc<ReplicationManager>>,
    config: EvictionConfig,
    trigger: Notify,
}

impl EvictionManager {
    pub fn new(store: Arc<ContentStore>, custodians: Arc<CustodianTable>, config: EvictionConfig) -> Self {
        Self {
            store,
            custodians,
            replication: None,
            config,
            trigger: Notify::new(),
        }
    }

    pub fn with_replication(mut self, replication: Arc<ReplicationManager>) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Wake the background loop if usage is over the high-water mark
    pub fn notify_write(&self) {
        if self.store.used_bytes() > self.config.high_water_bytes {
            self.trigger.notify_one();
        }
    }

    /// Evictable blobs in eviction order: lowest priority first, then least recently accessed
    pub async fn candidates(&self) -> Vec<BlobRecord> {
        let mut records: Vec<BlobRecord> = self
            .store
            .records()
            .await
            .into_iter()
            .filter(|r| !r.retain && !r.local_shards.is_empty())
            .collect();
        records.sort_by(|a, b| {
            let pa = ReachPolicy::for_level(a.reach).eviction_priority;
            let pb = ReachPolicy::for_level(b.reach).eviction_priority;
            pa.cmp(&pb)
                .then_with(|| a.last_accessed.cmp(&b.last_accessed))
                .then_with(|| a.manifest.digest.cmp(&b.manifest.digest))
        });
        records
    }

    /// Run one pass if usage is above the high-water mark
    pub async fn run_once(&self) -> StorageResult<EvictionReport> {
        let used = self.store.used_bytes();
        if used <= self.config.high_water_bytes {
            return Ok(EvictionReport {
                used_after: used,
                ..Default::default()
            });
        }
        info!(
            "Storage at {} bytes exceeds high water {}; evicting",
            used, self.config.high_water_bytes
        );
        self.evict_until(self.config.low_water_bytes).await
    }

    /// Release held shards, then evict candidates in order, until usage is
    /// below `target` or nothing evictable remains
    pub async fn evict_until(&self, target: u64) -> StorageResult<EvictionReport> {
        let mut report = EvictionReport::default();

        // Placing nodes notice the loss on their next presence check and re-place
        for shard_digest in self.store.held_shards().await {
            if self.store.used_bytes() < target {
                break;
            }
            let freed = self.store.release_held_shard(&shard_digest).await?;
            debug!("Released held shard {} ({} bytes)", shard_digest, freed);
            report.freed_bytes += freed;
            report.released_held.push(shard_digest);
        }
        if !report.released_held.is_empty() {
            info!(
                "Released {} held shards ({} bytes)",
                report.released_held.len(),
                report.freed_bytes
            );
        }

        for candidate in self.candidates().await {
            if self.store.used_bytes() < target {
                break;
            }
            let digest = candidate.manifest.digest.clone();

            // An active reader always wins; the blob is retried next pass
            let Some(_exclusive) = self.store.readers().try_exclusive(&digest) else {
                debug!("Skipping {}: active readers", digest);
                report.skipped_active.push(digest);
                continue;
            };

            // Re-read under the exclusive claim; a concurrent write may have changed it
            let Some(current) = self.store.record(&digest).await else {
                continue;
            };
            if current.retain {
                continue;
            }

            let acked = self.custodians.acked_shards(&digest).await;
            let rebuildable = acked.len() >= current.manifest.k as usize;
            let freed = if rebuildable {
                let indices: Vec<usize> = current.local_shards.iter().copied().collect();
                self.store.remove_local_shards(&digest, &indices).await?
            } else {
                // Nothing else can rebuild it, so the manifest goes too
                let freed = self.store.delete_blob(&digest).await?;
                match &self.replication {
                    Some(replication) => replication.forget_blob(&digest).await,
                    None => {
                        self.custodians.remove_blob(&digest).await;
                    }
                }
                freed
            };

            info!(
                "Evicted {} ({} reach, {} bytes freed)",
                digest, current.reach, freed
            );
            report.freed_bytes += freed;
            report.evicted.push(digest);
        }

        report.used_after = self.store.used_bytes();
        if report.used_after >= target && !report.skipped_active.is_empty() {
            warn!(
                "Eviction stopped at {} bytes; {} blobs busy",
                report.used_after,
                report.skipped_active.len()
            );
        }
        Ok(report)
    }

    /// Run passes on an interval, or sooner when a write pushes usage over the mark
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {}
                }
                if let Err(e) = self.run_once().await {
                    warn!("Eviction pass failed: {}", e);
                }
            }
            debug!("Eviction loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::crypto::{CryptoUtils, EncryptionMetadata};
    use crate::erasure::{encode, ErasureParams};
    use crate::storage::MemoryStorage;
    use crate::types::{Manifest, ReachLevel};

    async fn put(store: &ContentStore, seed: u8, reach: ReachLevel, age_secs: i64) -> String {
        let data: Vec<u8> = (0..400u32).map(|i| (i as u8).wrapping_mul(seed)).collect();
        let shards = encode(&data, ErasureParams::default()).unwrap();
        let at = Utc::now() - ChronoDuration::seconds(age_secs);
        let record = BlobRecord {
            manifest: Manifest {
                digest: CryptoUtils::content_hash(&data),
                size: 400,
                encoded_size: 400,
                shard_size: 100,
                shard_digests: shards.iter().map(|s| s.digest.clone()).collect(),
                k: 4,
                m: 3,
                encryption: EncryptionMetadata::cleartext(),
            },
            mime_type: "application/octet-stream".to_string(),
            reach,
            owner: "alice".to_string(),
            beneficiary: None,
            invited: BTreeSet::new(),
            created_at: at,
            last_accessed: at,
            local_shards: (0..7).collect(),
            retain: false,
            degraded: false,
        };
        let digest = record.manifest.digest.clone();
        store.write_blob(record, &shards).await.unwrap();
        digest
    }

    async fn setup(high: u64, low: u64) -> (Arc<ContentStore>, EvictionManager) {
        let store = Arc::new(ContentStore::open(Arc::new(MemoryStorage::new())).await.unwrap());
        let manager = EvictionManager::new(
            Arc::clone(&store),
            Arc::new(CustodianTable::in_memory()),
            EvictionConfig {
                high_water_bytes: high,
                low_water_bytes: low,
                interval: Duration::from_secs(60),
            },
        );
        (store, manager)
    }

    #[tokio::test]
    async fn test_widest_reach_goes_first() {
        let (store, manager) = setup(1000, 800).await;
        let local = put(&store, 3, ReachLevel::Local, 10).await;
        let commons = put(&store, 5, ReachLevel::Commons, 10).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec![commons.clone()]);
        assert!(store.contains(&local).await);
        assert!(!store.contains(&commons).await);
        assert!(report.used_after < 800);
    }

    #[tokio::test]
    async fn test_held_shards_released_before_own_blobs() {
        let (store, manager) = setup(10_000, 5_000).await;
        for seed in 0..20u8 {
            let bytes = vec![seed; 1000];
            store
                .store_held_shard(&CryptoUtils::content_hash(&bytes), &bytes, Some("node-b"))
                .await
                .unwrap();
        }
        let own = put(&store, 3, ReachLevel::Commons, 0).await;
        let oldest_first = store.held_shards().await;
        assert_eq!(store.used_bytes(), 20_700);

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.released_held, oldest_first[..16].to_vec());
        assert!(report.evicted.is_empty());
        assert_eq!(report.freed_bytes, 16_000);
        assert_eq!(report.used_after, 4_700);
        assert!(store.contains(&own).await);
        assert_eq!(store.held_shards().await, oldest_first[16..].to_vec());
    }

    #[tokio::test]
    async fn test_lru_breaks_ties() {
        let (store, manager) = setup(1500, 1000).await;
        let newer = put(&store, 3, ReachLevel::Regional, 5).await;
        let older = put(&store, 5, ReachLevel::Regional, 500).await;
        let _third = put(&store, 7, ReachLevel::Regional, 1).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec![older, newer]);
    }

    #[tokio::test]
    async fn test_below_high_water_is_noop() {
        let (store, manager) = setup(10_000, 8_000).await;
        put(&store, 3, ReachLevel::Commons, 0).await;
        assert!(manager.run_once().await.unwrap().evicted.is_empty());
    }

    #[tokio::test]
    async fn test_active_reader_is_skipped() {
        let (store, manager) = setup(100, 50).await;
        let digest = put(&store, 3, ReachLevel::Commons, 0).await;

        let guard = store.readers().acquire(&digest).await;
        let report = manager.run_once().await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.skipped_active, vec![digest.clone()]);

        drop(guard);
        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec![digest]);
    }

    #[tokio::test]
    async fn test_retained_blob_survives() {
        let (store, manager) = setup(100, 50).await;
        let digest = put(&store, 3, ReachLevel::Private, 0).await;
        store.set_retain(&digest, true).await.unwrap();

        let report = manager.run_once().await.unwrap();
        assert!(report.evicted.is_empty());
        assert!(store.contains(&digest).await);
    }

    #[tokio::test]
    async fn test_placed_blob_keeps_manifest() {
        let store = Arc::new(ContentStore::open(Arc::new(MemoryStorage::new())).await.unwrap());
        let custodians = Arc::new(CustodianTable::in_memory());
        let manager = EvictionManager::new(
            Arc::clone(&store),
            Arc::clone(&custodians),
            EvictionConfig {
                high_water_bytes: 100,
                low_water_bytes: 50,
                interval: Duration::from_secs(60),
            },
        );
        let digest = put(&store, 3, ReachLevel::Commons, 0).await;
        for index in 0..4 {
            custodians
                .record_placement("p1", &digest, index, &format!("s{}", index))
                .await;
        }

        manager.run_once().await.unwrap();
        let record = store.record(&digest).await.unwrap();
        assert!(record.local_shards.is_empty());
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_partially_placed_blob_is_dropped_whole() {
        let store = Arc::new(ContentStore::open(Arc::new(MemoryStorage::new())).await.unwrap());
        let custodians = Arc::new(CustodianTable::in_memory());
        let manager = EvictionManager::new(
            Arc::clone(&store),
            Arc::clone(&custodians),
            EvictionConfig {
                high_water_bytes: 100,
                low_water_bytes: 50,
                interval: Duration::from_secs(60),
            },
        );
        let digest = put(&store, 3, ReachLevel::Commons, 0).await;
        custodians.record_placement("p1", &digest, 0, "s0").await;

        manager.run_once().await.unwrap();
        assert!(!store.contains(&digest).await);
    }
}
