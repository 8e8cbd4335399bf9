//! Shard placement across custodians, health probing and re-placement.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::custodian::{CustodianRecord, CustodianTable, ProbeOutcome};
use super::peer::StoragePeer;
use super::transport::{ShardTransport, TransportError};
use crate::erasure::{ErasureCodec, ErasureError, ErasureParams};
use crate::policy::{classify, OwnerContext, SharedOracle};
use crate::storage::{ContentStore, StorageError};
use crate::types::{BlobRecord, PeerId, Shard};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Request to peer {0} timed out")]
    Timeout(PeerId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Erasure error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("Unknown blob {0}")]
    UnknownBlob(String),

    #[error("No custodian could supply shard {0}")]
    Unavailable(String),
}

/// Tuning for placement and probing
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Bound on every single peer call
    pub peer_timeout: Duration,
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub base_backoff: Duration,
    /// Concurrent peer calls across placement and probing
    pub concurrency: usize,
    pub probe_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_millis(5000),
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            concurrency: 4,
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one placement pass over a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementReport {
    pub digest: String,
    /// Shard indices held by at least one custodian
    pub acked: BTreeSet<usize>,
    /// Distinct peers holding shards of the blob
    pub custodians: usize,
    pub durable: bool,
    /// No peer met the trust floor; the local copy is the only one
    pub single_copy: bool,
}

/// Outcome of one probe pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub failures: usize,
    pub demoted: usize,
    pub replaced: usize,
    /// Demoted records dropped after failing past the abandon limit
    pub abandoned: usize,
}

/// A peer that clears a blob's trust floor
#[derive(Debug, Clone)]
struct Candidate {
    peer: StoragePeer,
    /// May read the blob anyway, so may hold enough shards to rebuild it
    entitled: bool,
}

pub struct ReplicationManager {
    peers: RwLock<BTreeMap<PeerId, StoragePeer>>,
    custodians: Arc<CustodianTable>,
    store: Arc<ContentStore>,
    transport: Arc<dyn ShardTransport>,
    oracle: SharedOracle,
    config: ReplicationConfig,
    limiter: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ReplicationManager {
    pub fn new(
        store: Arc<ContentStore>,
        custodians: Arc<CustodianTable>,
        transport: Arc<dyn ShardTransport>,
        oracle: SharedOracle,
        config: ReplicationConfig,
    ) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let limiter = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            peers: RwLock::new(BTreeMap::new()),
            custodians,
            store,
            transport,
            oracle,
            config,
            limiter,
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn custodians(&self) -> &Arc<CustodianTable> {
        &self.custodians
    }

    pub async fn add_peer(&self, peer: StoragePeer) {
        info!("Registered storage peer {} at {}", peer.peer_id, peer.address);
        self.peers.write().await.insert(peer.peer_id.clone(), peer);
    }

    /// Forget a peer for good, along with every custodian record pointing at it
    pub async fn remove_peer(&self, peer_id: &str) -> Vec<CustodianRecord> {
        self.peers.write().await.remove(peer_id);
        self.custodians.remove_peer(peer_id).await
    }

    pub async fn peers(&self) -> Vec<StoragePeer> {
        self.peers.read().await.values().cloned().collect()
    }

    async fn peer(&self, peer_id: &str) -> Option<StoragePeer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    async fn record_peer_outcome(&self, peer_id: &str, success: bool, latency: Option<Duration>) {
        if let Some(peer) = self.peers.write().await.get_mut(peer_id) {
            peer.record_outcome(success, latency.map(|d| d.as_millis() as u32));
        }
    }

    /// Queue a blob for background placement
    pub fn enqueue(&self, digest: &str) {
        if self.queue.send(digest.to_string()).is_err() {
            warn!("Placement queue closed; {} stays local-only", digest);
        }
    }

    fn owner_context(record: &BlobRecord) -> OwnerContext {
        OwnerContext {
            owner: record.owner.clone(),
            beneficiary: record.beneficiary.clone(),
            invited: record.invited.clone(),
        }
    }

    /// Healthy peers clearing the blob's replication trust floor, best first
    async fn candidates(&self, record: &BlobRecord) -> Vec<Candidate> {
        self.trusted_peers(record)
            .await
            .into_iter()
            .filter(|c| c.peer.is_healthy())
            .collect()
    }

    /// Peers clearing the blob's replication trust floor, healthy or not
    async fn trusted_peers(&self, record: &BlobRecord) -> Vec<Candidate> {
        let ctx = Self::owner_context(record);
        let mut peers = self.peers().await;
        peers.sort_by(StoragePeer::placement_order);

        let mut candidates = Vec::new();
        for peer in peers {
            let tier = self.oracle.trust_tier(&peer.peer_id, &record.owner).await;
            let decision = classify(record.reach, Some(&peer.peer_id), &ctx, tier);
            let floor_met = match decision.replication_trust_floor {
                None => true,
                Some(floor) => tier.map(|t| t >= floor).unwrap_or(false),
            };
            if floor_met {
                candidates.push(Candidate {
                    peer,
                    entitled: decision.servable,
                });
            }
        }
        candidates
    }

    /// Assign shard indices to peers round-robin. A peer never ends up with
    /// `k` or more shards of a blob unless it is entitled to read it.
    fn plan(
        candidates: &[Candidate],
        indices: &[usize],
        k: usize,
        mut per_peer: BTreeMap<PeerId, usize>,
        held_by: &BTreeMap<usize, BTreeSet<PeerId>>,
    ) -> Vec<(usize, StoragePeer)> {
        let mut plan = Vec::new();
        if candidates.is_empty() {
            return plan;
        }
        let mut cursor = 0;
        for index in indices {
            for step in 0..candidates.len() {
                let candidate = &candidates[(cursor + step) % candidates.len()];
                let id = &candidate.peer.peer_id;
                let count = per_peer.get(id).copied().unwrap_or(0);
                let capped = !candidate.entitled && count + 1 >= k;
                let already = held_by.get(index).map(|h| h.contains(id)).unwrap_or(false);
                if capped || already {
                    continue;
                }
                per_peer.insert(id.clone(), count + 1);
                plan.push((*index, candidate.peer.clone()));
                cursor = (cursor + step + 1) % candidates.len();
                break;
            }
        }
        plan
    }

    /// Push one shard with per-call timeout and exponential backoff
    async fn store_with_retry(
        &self,
        peer: &StoragePeer,
        shard: &Shard,
    ) -> Result<(), ReplicationError> {
        let mut delay = self.config.base_backoff;
        let mut last_error = ReplicationError::Timeout(peer.peer_id.clone());

        for attempt in 1..=self.config.max_attempts.max(1) {
            let _permit = self.limiter.acquire().await;
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.config.peer_timeout,
                self.transport.store_shard(peer, &shard.digest, &shard.bytes),
            )
            .await;
            drop(_permit);

            match result {
                Ok(Ok(())) => {
                    self.record_peer_outcome(&peer.peer_id, true, Some(started.elapsed()))
                        .await;
                    return Ok(());
                }
                Ok(Err(TransportError::Rejected(id, reason))) => {
                    self.record_peer_outcome(&peer.peer_id, false, None).await;
                    return Err(TransportError::Rejected(id, reason).into());
                }
                Ok(Err(e)) => last_error = e.into(),
                Err(_) => last_error = ReplicationError::Timeout(peer.peer_id.clone()),
            }

            self.record_peer_outcome(&peer.peer_id, false, None).await;
            warn!(
                "Placing shard {} on {} failed (attempt {}/{}): {}",
                shard.index, peer.peer_id, attempt, self.config.max_attempts, last_error
            );
            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Err(last_error)
    }

    /// Place whatever shards of the blob are not yet held by a custodian.
    /// Safe to call repeatedly; acknowledged shards are never re-sent.
    pub async fn place_blob(&self, digest: &str) -> Result<PlacementReport, ReplicationError> {
        let record = self
            .store
            .record(digest)
            .await
            .ok_or_else(|| ReplicationError::UnknownBlob(digest.to_string()))?;
        let k = record.manifest.k as usize;
        let m = record.manifest.m as usize;

        let trusted = self.trusted_peers(&record).await;
        if trusted.is_empty() {
            let single_copy = record.reach.is_addressed();
            if single_copy && !record.retain {
                self.store.set_retain(digest, true).await?;
            }
            info!(
                "No peer meets the trust floor for {} ({}); keeping it local",
                digest, record.reach
            );
            return Ok(PlacementReport {
                digest: digest.to_string(),
                acked: self.custodians.acked_shards(digest).await,
                custodians: 0,
                durable: true,
                single_copy,
            });
        }

        let candidates: Vec<Candidate> = trusted
            .into_iter()
            .filter(|c| c.peer.is_healthy())
            .collect();
        if candidates.is_empty() {
            warn!("Every trusted peer for {} is unhealthy; placement deferred", digest);
        }

        let acked = self.custodians.acked_shards(digest).await;
        let pending: Vec<usize> = record
            .local_shards
            .iter()
            .copied()
            .filter(|i| !acked.contains(i))
            .collect();

        let mut held_by: BTreeMap<usize, BTreeSet<PeerId>> = BTreeMap::new();
        for custodian in self.custodians.for_blob(digest).await {
            if custodian.held {
                held_by
                    .entry(custodian.shard_index)
                    .or_default()
                    .insert(custodian.peer_id);
            }
        }
        let per_peer = self.custodians.shards_per_peer(digest).await;
        let plan = Self::plan(&candidates, &pending, k, per_peer, &held_by);
        debug!("Placement plan for {}: {} shards", digest, plan.len());

        let placements = plan.into_iter().map(|(index, peer)| {
            let record = &record;
            async move {
                let shard = self.store.read_local_shard(record, index).await?;
                if !shard.verify() {
                    return Err(ReplicationError::Erasure(ErasureError::CorruptShard(index)));
                }
                self.store_with_retry(&peer, &shard).await?;
                self.custodians
                    .record_placement(&peer.peer_id, digest, index, &shard.digest)
                    .await;
                if let Some(p) = self.peers.write().await.get_mut(&peer.peer_id) {
                    p.load += 1;
                }
                Ok::<_, ReplicationError>((index, peer.peer_id))
            }
        });

        for result in join_all(placements).await {
            match result {
                Ok((index, peer_id)) => debug!("Shard {} of {} placed on {}", index, digest, peer_id),
                Err(e) => warn!("Placement for {} incomplete: {}", digest, e),
            }
        }

        let acked = self.custodians.acked_shards(digest).await;
        let custodians = self.custodians.shards_per_peer(digest).await.len();
        let durable = self.is_durable(digest, m).await;
        // Addressed content keeps its local copy until custodians alone can rebuild it
        let releasable = durable && acked.len() >= k;
        if record.reach.is_addressed() && record.retain == releasable {
            self.store.set_retain(digest, !releasable).await?;
        }
        info!(
            "Blob {} has {}/{} shards with {} custodians (durable: {})",
            digest,
            acked.len(),
            k + m,
            custodians,
            durable
        );
        Ok(PlacementReport {
            digest: digest.to_string(),
            acked,
            custodians,
            durable,
            single_copy: false,
        })
    }

    /// Whether at least `m + 1` distinct healthy custodians each hold a
    /// different shard of the blob
    pub async fn is_durable(&self, digest: &str, m: usize) -> bool {
        let peers = self.peers.read().await;
        let mut shards_by_peer: BTreeMap<PeerId, BTreeSet<usize>> = BTreeMap::new();
        for custodian in self.custodians.for_blob(digest).await {
            let healthy = peers
                .get(&custodian.peer_id)
                .map(StoragePeer::is_healthy)
                .unwrap_or(false);
            if custodian.held && healthy {
                shards_by_peer
                    .entry(custodian.peer_id)
                    .or_default()
                    .insert(custodian.shard_index);
            }
        }
        // Distinct shards that can each be paired with a distinct custodian
        let mut used = BTreeSet::new();
        let mut matched = 0;
        for shards in shards_by_peer.values() {
            if let Some(index) = shards.iter().find(|i| !used.contains(*i)) {
                used.insert(*index);
                matched += 1;
            }
        }
        matched >= m + 1
    }

    /// Fetch and verify one shard from any custodian holding it
    pub async fn fetch_shard(&self, record: &BlobRecord, index: usize) -> Result<Shard, ReplicationError> {
        let shard_digest = record
            .manifest
            .shard_digests
            .get(index)
            .ok_or_else(|| ReplicationError::Unavailable(format!("{}#{}", record.digest(), index)))?;

        for peer_id in self.custodians.holders(shard_digest).await {
            let Some(peer) = self.peer(&peer_id).await else {
                continue;
            };
            let _permit = self.limiter.acquire().await;
            let result = tokio::time::timeout(
                self.config.peer_timeout,
                self.transport.fetch_shard(&peer, shard_digest),
            )
            .await;
            drop(_permit);

            match result {
                Ok(Ok(bytes)) => {
                    let shard = Shard {
                        index,
                        digest: shard_digest.clone(),
                        bytes,
                    };
                    if shard.verify() {
                        self.record_peer_outcome(&peer_id, true, None).await;
                        return Ok(shard);
                    }
                    warn!("Custodian {} returned a corrupt copy of shard {}", peer_id, index);
                    self.custodians.record_probe(&peer_id, shard_digest, false).await;
                }
                Ok(Err(e)) => {
                    debug!("Fetching shard {} from {} failed: {}", index, peer_id, e);
                    self.record_peer_outcome(&peer_id, false, None).await;
                }
                Err(_) => {
                    debug!("Fetching shard {} from {} timed out", index, peer_id);
                    self.record_peer_outcome(&peer_id, false, None).await;
                }
            }
        }
        Err(ReplicationError::Unavailable(shard_digest.clone()))
    }

    /// Fetch, in parallel, every shard not in `have` that some custodian holds.
    /// Returns only verified shards.
    pub async fn fetch_remote_shards(&self, record: &BlobRecord, have: &BTreeSet<usize>) -> Vec<Shard> {
        let wanted: Vec<usize> = (0..record.manifest.total_shards())
            .filter(|i| !have.contains(i))
            .collect();
        let fetches = wanted.into_iter().map(|index| self.fetch_shard(record, index));
        join_all(fetches)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Rebuild one shard's bytes, from the local copy or from `k` custodians
    async fn recover_shard(&self, record: &BlobRecord, index: usize) -> Result<Shard, ReplicationError> {
        if record.local_shards.contains(&index) {
            let shard = self.store.read_local_shard(record, index).await?;
            if shard.verify() {
                return Ok(shard);
            }
        }

        let mut have = BTreeSet::new();
        let mut shards = Vec::new();
        for local in &record.local_shards {
            if let Ok(shard) = self.store.read_local_shard(record, *local).await {
                if shard.verify() {
                    have.insert(*local);
                    shards.push(shard);
                }
            }
        }
        have.insert(index);
        if shards.len() < record.manifest.k as usize {
            shards.extend(self.fetch_remote_shards(record, &have).await);
        }

        let codec = ErasureCodec::new(ErasureParams {
            data_shards: record.manifest.k as usize,
            parity_shards: record.manifest.m as usize,
        })?;
        let encoded = codec.decode(&shards, record.manifest.encoded_size as usize)?;
        codec
            .encode(&encoded)?
            .into_iter()
            .find(|s| s.index == index && Some(&s.digest) == record.manifest.shard_digests.get(index))
            .ok_or_else(|| ReplicationError::Unavailable(format!("{}#{}", record.digest(), index)))
    }

    /// Move a demoted custodian's shard to a substitute peer. Returns the new
    /// custodian, or `None` when no peer satisfies the trust floor.
    pub async fn replace_custodian(
        &self,
        demoted: &CustodianRecord,
    ) -> Result<Option<PeerId>, ReplicationError> {
        let Some(record) = self.store.record(&demoted.blob_digest).await else {
            self.custodians
                .remove(&demoted.peer_id, &demoted.shard_digest)
                .await;
            return Ok(None);
        };

        let holders: BTreeSet<PeerId> = self
            .custodians
            .for_blob(&demoted.blob_digest)
            .await
            .into_iter()
            .filter(|c| c.shard_index == demoted.shard_index)
            .map(|c| c.peer_id)
            .collect();
        let candidates: Vec<Candidate> = self
            .candidates(&record)
            .await
            .into_iter()
            .filter(|c| !holders.contains(&c.peer.peer_id) && c.peer.peer_id != demoted.peer_id)
            .collect();
        let plan = Self::plan(
            &candidates,
            &[demoted.shard_index],
            record.manifest.k as usize,
            self.custodians.shards_per_peer(&demoted.blob_digest).await,
            &BTreeMap::new(),
        );
        let Some((_, substitute)) = plan.into_iter().next() else {
            warn!(
                "No substitute custodian for shard {} of {}",
                demoted.shard_index, demoted.blob_digest
            );
            return Ok(None);
        };

        let shard = self.recover_shard(&record, demoted.shard_index).await?;
        self.store_with_retry(&substitute, &shard).await?;
        self.custodians
            .record_placement(
                &substitute.peer_id,
                &demoted.blob_digest,
                demoted.shard_index,
                &shard.digest,
            )
            .await;
        self.custodians
            .remove(&demoted.peer_id, &demoted.shard_digest)
            .await;
        info!(
            "Re-placed shard {} of {} from {} to {}",
            demoted.shard_index, demoted.blob_digest, demoted.peer_id, substitute.peer_id
        );
        Ok(Some(substitute.peer_id))
    }

    /// Probe every custodian once, demoting and re-placing as needed
    pub async fn probe_once(&self) -> ProbeReport {
        let records = self.custodians.all().await;
        let mut report = ProbeReport {
            probed: records.len(),
            ..Default::default()
        };

        let probes = stream::iter(records)
            .map(|custodian| async move {
                let success = match self.peer(&custodian.peer_id).await {
                    Some(peer) => {
                        let started = Instant::now();
                        let result = tokio::time::timeout(
                            self.config.peer_timeout,
                            self.transport.probe_shard(&peer, &custodian.shard_digest),
                        )
                        .await;
                        let ok = matches!(result, Ok(Ok(true)));
                        self.record_peer_outcome(
                            &custodian.peer_id,
                            ok,
                            ok.then(|| started.elapsed()),
                        )
                        .await;
                        ok
                    }
                    None => false,
                };
                let outcome = self
                    .custodians
                    .record_probe(&custodian.peer_id, &custodian.shard_digest, success)
                    .await;
                (custodian, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        for (custodian, outcome) in probes {
            match outcome {
                Some(ProbeOutcome::Healthy) | None => {}
                // Already demoted: a substitute may have appeared since
                Some(ProbeOutcome::Failing(_)) if !custodian.held => {
                    report.failures += 1;
                    if self.try_replace(&custodian).await {
                        report.replaced += 1;
                    }
                }
                Some(ProbeOutcome::Failing(_)) => report.failures += 1,
                Some(ProbeOutcome::Demoted) => {
                    report.failures += 1;
                    report.demoted += 1;
                    warn!(
                        "Custodian {} demoted for shard {} of {}",
                        custodian.peer_id, custodian.shard_index, custodian.blob_digest
                    );
                    if self.try_replace(&custodian).await {
                        report.replaced += 1;
                    }
                }
                Some(ProbeOutcome::Abandoned) => {
                    report.failures += 1;
                    report.abandoned += 1;
                    warn!(
                        "Abandoned custodian {} for shard {} of {}",
                        custodian.peer_id, custodian.shard_index, custodian.blob_digest
                    );
                    self.enqueue(&custodian.blob_digest);
                }
            }
        }
        report
    }

    async fn try_replace(&self, custodian: &CustodianRecord) -> bool {
        match self.replace_custodian(custodian).await {
            Ok(replaced) => replaced.is_some(),
            Err(e) => {
                error!(
                    "Re-placement of shard {} of {} failed: {}",
                    custodian.shard_index, custodian.blob_digest, e
                );
                false
            }
        }
    }

    /// Drop custodian records of a blob whose retention ended and release
    /// the shards its custodians hold. Unreachable custodians keep their copy
    /// until their own eviction or an operator clears it.
    pub async fn forget_blob(&self, digest: &str) {
        let removed = self.custodians.remove_blob(digest).await;
        let retractions = removed.iter().map(|custodian| async move {
            let Some(peer) = self.peer(&custodian.peer_id).await else {
                return;
            };
            let result = tokio::time::timeout(
                self.config.peer_timeout,
                self.transport.retract_shard(&peer, &custodian.shard_digest),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Could not release shard {} on {}: {}",
                    custodian.shard_index, custodian.peer_id, e
                ),
                Err(_) => warn!(
                    "Releasing shard {} on {} timed out",
                    custodian.shard_index, custodian.peer_id
                ),
            }
        });
        join_all(retractions).await;
        debug!("Forgot {} custodian records of {}", removed.len(), digest);
    }

    /// Drain the placement queue until shutdown
    pub async fn spawn_placement_worker(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().await.take()?;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = rx.recv() => match next {
                        Some(digest) => {
                            if let Err(e) = self.place_blob(&digest).await {
                                warn!("Placement of {} failed: {}", digest, e);
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("Placement worker stopped");
        }))
    }

    /// Probe custodians on a fixed interval until shutdown
    pub fn spawn_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.probe_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let report = self.probe_once().await;
                        if report.demoted > 0 || report.failures > 0 {
                            info!(
                                "Probe pass: {} probed, {} failing, {} demoted, {} re-placed",
                                report.probed, report.failures, report.demoted, report.replaced
                            );
                        }
                    }
                }
            }
            debug!("Probe loop stopped");
        })
    }
}
