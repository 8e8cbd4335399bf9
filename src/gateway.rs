//! Delivery gateway: every read passes the sovereignty gate and the reach
//! gate before any shard is touched.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::crypto::{CryptoUtils, KeyManager};
use crate::distributed::ReplicationManager;
use crate::erasure::{ErasureCodec, ErasureParams};
use crate::error::{EngineError, EngineResult};
use crate::eviction::EvictionManager;
use crate::policy::{evaluate, OwnerContext, ReachPolicy, SharedOracle, TrustOracleExt};
use crate::sovereignty::SovereigntyGate;
use crate::storage::ContentStore;
use crate::types::{BlobRecord, IdentityId, KeyScope, Manifest, ReachLevel, Shard};

/// A blob write as submitted by its owner
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub reach: ReachLevel,
    pub owner: IdentityId,
    /// Sole reader of private content; defaults to the owner
    pub beneficiary: Option<IdentityId>,
    pub invited: BTreeSet<IdentityId>,
}

impl PutRequest {
    pub fn new(bytes: Vec<u8>, reach: ReachLevel, owner: impl Into<IdentityId>) -> Self {
        Self {
            bytes,
            mime_type: "application/octet-stream".to_string(),
            reach,
            owner: owner.into(),
            beneficiary: None,
            invited: BTreeSet::new(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_beneficiary(mut self, beneficiary: impl Into<IdentityId>) -> Self {
        self.beneficiary = Some(beneficiary.into());
        self
    }

    pub fn with_invited(mut self, invited: impl IntoIterator<Item = IdentityId>) -> Self {
        self.invited = invited.into_iter().collect();
        self
    }
}

/// Bytes returned to a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Node health signal
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub sovereignty: String,
    pub blobs: usize,
    pub used_bytes: u64,
    pub degraded: Vec<String>,
}

pub struct DeliveryGateway {
    store: Arc<ContentStore>,
    keys: Arc<KeyManager>,
    oracle: SharedOracle,
    sovereignty: SovereigntyGate,
    replication: Arc<ReplicationManager>,
    eviction: Arc<EvictionManager>,
    codec: ErasureCodec,
    digest_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn owner_context(record: &BlobRecord) -> OwnerContext {
    OwnerContext {
        owner: record.owner.clone(),
        beneficiary: record.beneficiary.clone(),
        invited: record.invited.clone(),
    }
}

/// This node holds the key material of the identities it serves, so
/// readers named by the write are provisioned on first use.
fn provision_keys(keys: &KeyManager, scope: KeyScope, ctx: &OwnerContext) -> EngineResult<()> {
    match scope {
        KeyScope::Cleartext => {}
        KeyScope::Beneficiary => {
            keys.ensure_identity(ctx.beneficiary())?;
        }
        KeyScope::SharedInvite => {
            for id in &ctx.invited {
                keys.ensure_identity(id)?;
            }
        }
        KeyScope::Cluster => {
            if keys.cluster_info()?.is_none() {
                keys.generate_cluster_key([ctx.owner.clone()])?;
            } else if !keys.is_cluster_member(&ctx.owner)? {
                keys.add_cluster_member(&ctx.owner)?;
            }
        }
    }
    Ok(())
}

impl DeliveryGateway {
    pub fn new(
        store: Arc<ContentStore>,
        keys: Arc<KeyManager>,
        oracle: SharedOracle,
        sovereignty: SovereigntyGate,
        replication: Arc<ReplicationManager>,
        eviction: Arc<EvictionManager>,
        params: ErasureParams,
    ) -> EngineResult<Self> {
        let codec = ErasureCodec::new(params)?;
        Ok(Self {
            store,
            keys,
            oracle,
            sovereignty,
            replication,
            eviction,
            codec,
            digest_locks: DashMap::new(),
        })
    }

    pub fn sovereignty(&self) -> &SovereigntyGate {
        &self.sovereignty
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    fn digest_lock(&self, digest: &str) -> Arc<Mutex<()>> {
        self.digest_locks
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_digest_lock(&self, digest: &str) {
        // Only the map itself still holds the lock once every writer is done
        self.digest_locks
            .remove_if(digest, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Store a blob: encrypt per its reach, erasure-code, persist, then queue placement
    pub async fn put(&self, request: PutRequest) -> EngineResult<Manifest> {
        if request.owner.trim().is_empty() {
            return Err(EngineError::InvalidRequest("owner is required".to_string()));
        }
        let digest = CryptoUtils::content_hash(&request.bytes);

        let lock = self.digest_lock(&digest);
        let result = {
            let _guard = lock.lock().await;
            self.put_locked(&digest, request).await
        };
        drop(lock);
        self.release_digest_lock(&digest);
        result
    }

    async fn put_locked(&self, digest: &str, request: PutRequest) -> EngineResult<Manifest> {
        let ctx = OwnerContext {
            owner: request.owner.clone(),
            beneficiary: match request.reach {
                ReachLevel::Private => {
                    Some(request.beneficiary.clone().unwrap_or_else(|| request.owner.clone()))
                }
                _ => request.beneficiary.clone(),
            },
            invited: request.invited.clone(),
        };

        if let Some(existing) = self.store.record(digest).await {
            if existing.reach == request.reach && owner_context(&existing) == ctx {
                debug!("Blob {} already stored", digest);
                return Ok(existing.manifest);
            }
            return Err(EngineError::PolicyConflict(format!(
                "{} is already stored under a different reach context",
                digest
            )));
        }

        let policy = ReachPolicy::for_level(request.reach);
        // Provisioning may write the key store, which is blocking file I/O
        let keys = Arc::clone(&self.keys);
        let provision_ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            provision_keys(&keys, policy.key_scope, &provision_ctx)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("key provisioning failed: {}", e)))??;
        let (encoded, encryption) =
            self.keys
                .encrypt_for(policy.key_scope, ctx.beneficiary(), &ctx.invited, &request.bytes)?;
        let shards = self.codec.encode(&encoded)?;
        let params = self.codec.params();

        let manifest = Manifest {
            digest: digest.to_string(),
            size: request.bytes.len() as u64,
            encoded_size: encoded.len() as u64,
            shard_size: params.shard_size(encoded.len()) as u64,
            shard_digests: shards.iter().map(|s| s.digest.clone()).collect(),
            k: params.data_shards as u8,
            m: params.parity_shards as u8,
            encryption,
        };

        let now = Utc::now();
        let record = BlobRecord {
            manifest: manifest.clone(),
            mime_type: request.mime_type,
            reach: request.reach,
            owner: ctx.owner,
            beneficiary: ctx.beneficiary,
            invited: ctx.invited,
            created_at: now,
            last_accessed: now,
            local_shards: (0..shards.len()).collect(),
            // Addressed content is the only copy until placement says otherwise
            retain: request.reach.is_addressed(),
            degraded: false,
        };
        self.store.write_blob(record, &shards).await?;
        info!(
            "Stored {} ({} bytes, {} reach, {}+{} shards)",
            digest,
            manifest.size,
            request.reach,
            manifest.k,
            manifest.m
        );

        if self.sovereignty.should_replicate() {
            self.replication.enqueue(digest);
        }
        self.eviction.notify_write();
        Ok(manifest)
    }

    /// Both gates, in order. Denials are logged but never explained to the caller.
    async fn authorize(&self, digest: &str, requester: Option<&str>) -> EngineResult<BlobRecord> {
        if !self.sovereignty.should_serve_at_all(requester) {
            debug!("Denied {:?} by sovereignty gate", requester);
            return Err(EngineError::Forbidden);
        }
        let record = self
            .store
            .record(digest)
            .await
            .ok_or_else(|| EngineError::NotFound(digest.to_string()))?;
        let decision = evaluate(
            self.oracle.as_ref(),
            record.reach,
            requester,
            &owner_context(&record),
        )
        .await;
        if !decision.servable {
            debug!("Denied {:?} by reach gate for {}", requester, digest);
            return Err(EngineError::Forbidden);
        }
        Ok(record)
    }

    /// Manifest of a blob, behind the same gates as its bytes
    pub async fn manifest(&self, digest: &str, requester: Option<&str>) -> EngineResult<Manifest> {
        self.authorize(digest, requester).await.map(|r| r.manifest)
    }

    /// Serve a blob to `requester`
    pub async fn serve(&self, digest: &str, requester: Option<&str>) -> EngineResult<ServedBlob> {
        self.authorize(digest, requester).await?;

        let _reader = self.store.readers().acquire(digest).await;
        // The record may have changed while waiting out an eviction
        let record = self
            .store
            .record(digest)
            .await
            .ok_or_else(|| EngineError::NotFound(digest.to_string()))?;
        let k = record.manifest.k as usize;

        let mut shards = self.gather_local(&record).await?;
        if shards.len() < k {
            let have: BTreeSet<usize> = shards.iter().map(|s| s.index).collect();
            let remote = self.replication.fetch_remote_shards(&record, &have).await;
            debug!("Fetched {} remote shards of {}", remote.len(), digest);
            shards.extend(remote);
        }
        if shards.len() < k {
            return Err(EngineError::InsufficientShards {
                needed: k,
                available: shards.len(),
            });
        }

        let codec = ErasureCodec::new(ErasureParams {
            data_shards: k,
            parity_shards: record.manifest.m as usize,
        })?;
        let encoded = codec.decode(&shards, record.manifest.encoded_size as usize)?;
        let bytes = self
            .keys
            .decrypt_for(requester, &record.manifest.encryption, &encoded)?;
        if !CryptoUtils::verify_content_hash(&bytes, digest) {
            return Err(EngineError::Internal(format!(
                "reconstructed bytes do not match {}",
                digest
            )));
        }

        if let Err(e) = self.store.touch(digest).await {
            warn!("Failed to update access time of {}: {}", digest, e);
        }
        Ok(ServedBlob {
            bytes,
            mime_type: record.mime_type,
        })
    }

    /// Read verified local shards, repairing corrupt ones from custodians
    async fn gather_local(&self, record: &BlobRecord) -> EngineResult<Vec<Shard>> {
        let mut shards = Vec::new();
        let mut unrepaired = false;

        for index in &record.local_shards {
            match self.store.read_local_shard(record, *index).await {
                Ok(shard) if shard.verify() => {
                    shards.push(shard);
                    continue;
                }
                Ok(_) => warn!("Local shard {} of {} is corrupt", index, record.digest()),
                Err(e) => warn!("Local shard {} of {} unreadable: {}", index, record.digest(), e),
            }

            match self.replication.fetch_shard(record, *index).await {
                Ok(shard) => {
                    self.store.replace_shard(&shard).await?;
                    info!("Repaired shard {} of {} from a custodian", index, record.digest());
                    shards.push(shard);
                }
                Err(e) => {
                    error!(
                        "Shard {} of {} cannot be repaired: {}",
                        index,
                        record.digest(),
                        e
                    );
                    unrepaired = true;
                }
            }
        }

        if unrepaired != record.degraded {
            self.store.set_degraded(record.digest(), unrepaired).await?;
        }
        Ok(shards)
    }

    /// Remove a blob on behalf of its owner or beneficiary
    pub async fn delete(&self, digest: &str, requester: Option<&str>) -> EngineResult<()> {
        let record = self
            .store
            .record(digest)
            .await
            .ok_or_else(|| EngineError::NotFound(digest.to_string()))?;
        let allowed = match requester {
            Some(id) => id == record.owner || record.beneficiary.as_deref() == Some(id),
            None => false,
        };
        if !allowed {
            return Err(EngineError::Forbidden);
        }

        let lock = self.digest_lock(digest);
        let result = {
            let _guard = lock.lock().await;
            let _exclusive = self.store.readers().exclusive(digest).await;
            self.store.delete_blob(digest).await.map(|_| ())
        };
        drop(lock);
        self.release_digest_lock(digest);
        result?;

        self.replication.forget_blob(digest).await;
        info!("Blob {} deleted by {:?}", digest, requester);
        Ok(())
    }

    fn check_peer_gate(&self) -> EngineResult<()> {
        if self.sovereignty.serves_peers() {
            Ok(())
        } else {
            Err(EngineError::Forbidden)
        }
    }

    /// Whether this node holds a shard
    pub async fn head_shard(&self, shard_digest: &str) -> EngineResult<bool> {
        self.check_peer_gate()?;
        Ok(self.store.has_shard(shard_digest).await)
    }

    /// Raw shard bytes for a custodian or a rebuilding peer. Shards of this
    /// node's own blobs go only to peers clearing the blob's trust floor.
    pub async fn shard_bytes(&self, shard_digest: &str, peer: Option<&str>) -> EngineResult<Vec<u8>> {
        self.check_peer_gate()?;
        if !self.store.has_shard(shard_digest).await {
            return Err(EngineError::NotFound(shard_digest.to_string()));
        }

        if let Some(record) = self.store.owning_blob(shard_digest).await {
            let admitted = match peer {
                Some(peer) => self.oracle.peer_admitted(peer, &record.owner, record.reach).await,
                None => ReachPolicy::for_level(record.reach).trust_floor.is_none(),
            };
            if !admitted {
                debug!("Denied shard {} to peer {:?}", shard_digest, peer);
                return Err(EngineError::Forbidden);
            }
        }

        Ok(self.store.read_shard(shard_digest).await?)
    }

    /// Keep a shard pushed by a placing peer
    pub async fn accept_shard(&self, shard_digest: &str, bytes: &[u8], peer: Option<&str>) -> EngineResult<()> {
        self.check_peer_gate()?;
        if !CryptoUtils::is_valid_digest(shard_digest) {
            return Err(EngineError::InvalidRequest(format!(
                "malformed digest {}",
                shard_digest
            )));
        }
        if !CryptoUtils::verify_content_hash(bytes, shard_digest) {
            return Err(EngineError::InvalidRequest(format!(
                "body does not hash to {}",
                shard_digest
            )));
        }
        // Bytes already on disk cost nothing more to hold
        if !self.store.has_shard(shard_digest).await {
            let after = self.store.used_bytes() + bytes.len() as u64;
            let budget = self.eviction.config().high_water_bytes;
            if after > budget {
                warn!(
                    "Refusing shard {} from {:?}: {} bytes would exceed {}",
                    shard_digest, peer, after, budget
                );
                self.eviction.notify_write();
                return Err(EngineError::InsufficientStorage {
                    needed: after - budget,
                });
            }
        }
        self.store.store_held_shard(shard_digest, bytes, peer).await?;
        debug!("Accepted shard {} from {:?}", shard_digest, peer);
        self.eviction.notify_write();
        Ok(())
    }

    /// Drop a shard held for `peer` once it no longer needs it kept
    pub async fn release_shard(&self, shard_digest: &str, peer: Option<&str>) -> EngineResult<()> {
        self.check_peer_gate()?;
        if !self.store.is_held(shard_digest).await {
            return Err(EngineError::NotFound(shard_digest.to_string()));
        }
        if let Some(owner) = self.store.held_for(shard_digest).await {
            if peer != Some(owner.as_str()) {
                debug!("Denied release of {} to {:?}", shard_digest, peer);
                return Err(EngineError::Forbidden);
            }
        }
        let freed = self.store.release_held_shard(shard_digest).await?;
        debug!(
            "Released shard {} for {:?} ({} bytes)",
            shard_digest, peer, freed
        );
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let degraded = self.store.degraded().await;
        HealthReport {
            status: if degraded.is_empty() { "ok" } else { "degraded" },
            sovereignty: self.sovereignty.mode().to_string(),
            blobs: self.store.blob_count().await,
            used_bytes: self.store.used_bytes(),
            degraded,
        }
    }
}
