//! Arena of custodian records keyed by (peer, shard digest).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::storage::{JsonStorage, Storage, StorageError, StorageResult};
use crate::types::PeerId;

/// Consecutive probe failures that demote a custodian
pub const FAILURE_THRESHOLD: u32 = 3;

/// Further failures after demotion before a record is dropped outright
pub const ABANDON_AFTER: u32 = 3;

const TABLE_KEY: &str = "custodians/table.json";

type CustodianKey = (PeerId, String);

/// Where one copy of one shard lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianRecord {
    pub peer_id: PeerId,
    pub shard_digest: String,
    pub blob_digest: String,
    pub shard_index: usize,
    pub placed_at: DateTime<Utc>,
    pub last_probed: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Whether the peer is currently believed to hold the shard
    pub held: bool,
}

/// Result of folding one probe into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Failing(u32),
    /// The failure that crossed the threshold; the shard needs a new home
    Demoted,
    /// A demoted record kept failing and was removed from the table
    Abandoned,
}

/// Custodian table with explicit read/write locking, persisted as one JSON record
pub struct CustodianTable {
    records: RwLock<BTreeMap<CustodianKey, CustodianRecord>>,
    backend: Option<Arc<dyn Storage>>,
}

impl CustodianTable {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            backend: None,
        }
    }

    /// Load the table from `backend`, starting empty if it was never written
    pub async fn open(backend: Arc<dyn Storage>) -> StorageResult<Self> {
        let rows: Vec<CustodianRecord> = match backend.get_json(TABLE_KEY).await {
            Ok(rows) => rows,
            Err(StorageError::KeyNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let records = rows
            .into_iter()
            .map(|r| ((r.peer_id.clone(), r.shard_digest.clone()), r))
            .collect();
        Ok(Self {
            records: RwLock::new(records),
            backend: Some(backend),
        })
    }

    async fn persist(&self, records: &BTreeMap<CustodianKey, CustodianRecord>) {
        let Some(backend) = &self.backend else {
            return;
        };
        let rows: Vec<&CustodianRecord> = records.values().collect();
        if let Err(e) = backend.put_json(TABLE_KEY, &rows).await {
            // Probing rebuilds the table's truth, so a missed write is not fatal
            warn!("Failed to persist custodian table: {}", e);
        }
    }

    /// Record an acknowledged placement
    pub async fn record_placement(
        &self,
        peer_id: &str,
        blob_digest: &str,
        shard_index: usize,
        shard_digest: &str,
    ) {
        let mut records = self.records.write().await;
        let now = Utc::now();
        records.insert(
            (peer_id.to_string(), shard_digest.to_string()),
            CustodianRecord {
                peer_id: peer_id.to_string(),
                shard_digest: shard_digest.to_string(),
                blob_digest: blob_digest.to_string(),
                shard_index,
                placed_at: now,
                last_probed: Some(now),
                consecutive_successes: 1,
                consecutive_failures: 0,
                held: true,
            },
        );
        self.persist(&records).await;
    }

    /// Fold a probe result into the record; `None` if the record is unknown
    pub async fn record_probe(
        &self,
        peer_id: &str,
        shard_digest: &str,
        success: bool,
    ) -> Option<ProbeOutcome> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&(peer_id.to_string(), shard_digest.to_string()))?;
        record.last_probed = Some(Utc::now());

        let outcome = if success {
            record.consecutive_successes += 1;
            record.consecutive_failures = 0;
            record.held = true;
            ProbeOutcome::Healthy
        } else {
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            if record.held && record.consecutive_failures >= FAILURE_THRESHOLD {
                record.held = false;
                ProbeOutcome::Demoted
            } else if !record.held
                && record.consecutive_failures >= FAILURE_THRESHOLD + ABANDON_AFTER
            {
                ProbeOutcome::Abandoned
            } else {
                ProbeOutcome::Failing(record.consecutive_failures)
            }
        };
        debug!(
            "Probe of {} on {}: {:?}",
            shard_digest, peer_id, outcome
        );
        if outcome == ProbeOutcome::Abandoned {
            records.remove(&(peer_id.to_string(), shard_digest.to_string()));
        }
        self.persist(&records).await;
        Some(outcome)
    }

    pub async fn get(&self, peer_id: &str, shard_digest: &str) -> Option<CustodianRecord> {
        self.records
            .read()
            .await
            .get(&(peer_id.to_string(), shard_digest.to_string()))
            .cloned()
    }

    pub async fn all(&self) -> Vec<CustodianRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn for_blob(&self, blob_digest: &str) -> Vec<CustodianRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.blob_digest == blob_digest)
            .cloned()
            .collect()
    }

    /// Peers currently believed to hold a shard
    pub async fn holders(&self, shard_digest: &str) -> Vec<PeerId> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.held && r.shard_digest == shard_digest)
            .map(|r| r.peer_id.clone())
            .collect()
    }

    /// Shard indices of a blob held by at least one custodian
    pub async fn acked_shards(&self, blob_digest: &str) -> BTreeSet<usize> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.held && r.blob_digest == blob_digest)
            .map(|r| r.shard_index)
            .collect()
    }

    /// Held shard count of a blob per peer
    pub async fn shards_per_peer(&self, blob_digest: &str) -> BTreeMap<PeerId, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.read().await.values() {
            if record.held && record.blob_digest == blob_digest {
                *counts.entry(record.peer_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub async fn remove(&self, peer_id: &str, shard_digest: &str) -> Option<CustodianRecord> {
        let mut records = self.records.write().await;
        let removed = records.remove(&(peer_id.to_string(), shard_digest.to_string()));
        if removed.is_some() {
            self.persist(&records).await;
        }
        removed
    }

    /// Drop every record of a blob whose retention has ended
    pub async fn remove_blob(&self, blob_digest: &str) -> Vec<CustodianRecord> {
        let mut records = self.records.write().await;
        let keys: Vec<CustodianKey> = records
            .iter()
            .filter(|(_, r)| r.blob_digest == blob_digest)
            .map(|(k, _)| k.clone())
            .collect();
        let removed: Vec<CustodianRecord> =
            keys.iter().filter_map(|k| records.remove(k)).collect();
        if !removed.is_empty() {
            self.persist(&records).await;
        }
        removed
    }

    /// Drop every record pointing at a peer that is gone for good
    pub async fn remove_peer(&self, peer_id: &str) -> Vec<CustodianRecord> {
        let mut records = self.records.write().await;
        let keys: Vec<CustodianKey> = records
            .keys()
            .filter(|(peer, _)| peer == peer_id)
            .cloned()
            .collect();
        let removed: Vec<CustodianRecord> =
            keys.iter().filter_map(|k| records.remove(k)).collect();
        if !removed.is_empty() {
            self.persist(&records).await;
        }
        removed
    }
}
