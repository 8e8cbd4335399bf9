mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use reach_store::crypto::{CryptoUtils, KeyManager};
use reach_store::distributed::{MemoryTransport, ShardTransport};
use reach_store::policy::{SharedOracle, StaticTrustOracle};
use reach_store::sovereignty::SovereigntyMode;
use reach_store::storage::{MemoryStorage, Storage};
use reach_store::types::TrustTier;
use reach_store::{EngineError, Node, NodeConfig, PutRequest, ReachLevel};

use common::{build, config, payload};

#[tokio::test]
async fn test_commons_blob_round_trips_through_seven_shards() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let bytes = payload(2_097_152, 1);

    let manifest = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Commons, "alice"))
        .await
        .unwrap();
    assert_eq!(manifest.size, 2_097_152);
    assert_eq!(manifest.k, 4);
    assert_eq!(manifest.m, 3);
    assert_eq!(manifest.shard_digests.len(), 7);
    assert_eq!(manifest.shard_size, 524_288);
    assert!(!manifest.encryption.is_encrypted());

    let served = gateway.serve(&manifest.digest, None).await.unwrap();
    assert_eq!(served.bytes.len(), 2_097_152);
    assert_eq!(served.bytes, bytes);
}

#[tokio::test]
async fn test_private_blob_served_only_to_beneficiary() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let bytes = payload(10_000, 2);

    let manifest = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Private, "alice"))
        .await
        .unwrap();
    assert!(manifest.encryption.is_encrypted());

    // Even the closest relationship does not open someone else's private content
    test.oracle.set_tier("bob", "alice", TrustTier::Family).await;
    assert!(matches!(
        gateway.serve(&manifest.digest, Some("bob")).await,
        Err(EngineError::Forbidden)
    ));
    assert!(matches!(
        gateway.serve(&manifest.digest, None).await,
        Err(EngineError::Forbidden)
    ));

    let served = gateway.serve(&manifest.digest, Some("alice")).await.unwrap();
    assert_eq!(served.bytes, bytes);
}

#[tokio::test]
async fn test_private_blob_with_named_beneficiary() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let bytes = payload(5_000, 3);

    let manifest = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Private, "alice").with_beneficiary("dana"))
        .await
        .unwrap();

    assert!(matches!(
        gateway.serve(&manifest.digest, Some("alice")).await,
        Err(EngineError::Forbidden)
    ));
    assert_eq!(
        gateway.serve(&manifest.digest, Some("dana")).await.unwrap().bytes,
        bytes
    );
}

#[tokio::test]
async fn test_laptop_serves_nobody() {
    let test = build(config(SovereigntyMode::Laptop)).await;
    let gateway = test.node.gateway();

    let manifest = gateway
        .put(PutRequest::new(payload(4_096, 4), ReachLevel::Commons, "alice"))
        .await
        .unwrap();

    test.oracle.set_tier("bob", "alice", TrustTier::Family).await;
    for requester in [None, Some("alice"), Some("bob"), Some("mallory")] {
        assert!(matches!(
            gateway.serve(&manifest.digest, requester).await,
            Err(EngineError::Forbidden)
        ));
    }
    assert!(matches!(
        gateway.shard_bytes(&manifest.shard_digests[0], Some("peer")).await,
        Err(EngineError::Forbidden)
    ));
}

#[tokio::test]
async fn test_widest_reach_is_evicted_first() {
    let mut cfg = config(SovereigntyMode::Network);
    cfg.high_water_bytes = 1;
    cfg.low_water_bytes = 0;
    let test = build(cfg).await;
    let gateway = test.node.gateway();
    let store = test.node.store();

    let commons = gateway
        .put(PutRequest::new(payload(8_000, 5), ReachLevel::Commons, "alice"))
        .await
        .unwrap();
    let local = gateway
        .put(PutRequest::new(payload(8_000, 6), ReachLevel::Local, "alice"))
        .await
        .unwrap();

    let at = Utc::now() - ChronoDuration::seconds(60);
    for digest in [&commons.digest, &local.digest] {
        store
            .update_record(digest, |r| r.last_accessed = at)
            .await
            .unwrap();
    }

    // Free anything at all; the first candidate is the one that goes
    let report = test
        .node
        .eviction()
        .evict_until(store.used_bytes())
        .await
        .unwrap();
    assert_eq!(report.evicted, vec![commons.digest.clone()]);
    assert!(!store.contains(&commons.digest).await);
    assert!(store.contains(&local.digest).await);
}

#[tokio::test]
async fn test_rewrite_is_idempotent_but_reach_is_fixed() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let bytes = payload(3_000, 7);

    let first = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Municipal, "alice"))
        .await
        .unwrap();
    let again = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Municipal, "alice"))
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(test.node.store().blob_count().await, 1);

    assert!(matches!(
        gateway
            .put(PutRequest::new(bytes, ReachLevel::Commons, "alice"))
            .await,
        Err(EngineError::PolicyConflict(_))
    ));
}

#[tokio::test]
async fn test_delete_requires_owner() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let manifest = gateway
        .put(PutRequest::new(payload(2_000, 8), ReachLevel::Commons, "alice"))
        .await
        .unwrap();

    assert!(matches!(
        gateway.delete(&manifest.digest, Some("bob")).await,
        Err(EngineError::Forbidden)
    ));
    gateway.delete(&manifest.digest, Some("alice")).await.unwrap();
    assert!(matches!(
        gateway.serve(&manifest.digest, None).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(test.node.store().used_bytes(), 0);
}

#[tokio::test]
async fn test_corrupt_local_shard_is_tolerated() {
    let test = build(config(SovereigntyMode::Network)).await;
    let gateway = test.node.gateway();
    let bytes = payload(40_000, 9);
    let manifest = gateway
        .put(PutRequest::new(bytes.clone(), ReachLevel::Commons, "alice"))
        .await
        .unwrap();

    let shard = &manifest.shard_digests[1];
    let key = reach_store::storage::content_store::shard_key(shard).unwrap();
    test.backend.tamper(&key, vec![0u8; 16]).await;

    // Six good shards remain, so the blob still reconstructs
    let served = gateway.serve(&manifest.digest, Some("bob")).await.unwrap();
    assert_eq!(served.bytes, bytes);

    let health = gateway.health().await;
    assert_eq!(health.status, "degraded");
    assert_eq!(health.degraded, vec![manifest.digest.clone()]);
}

#[tokio::test]
async fn test_private_blob_survives_eviction_before_placement() {
    for mode in [SovereigntyMode::Network, SovereigntyMode::Laptop] {
        let mut cfg = config(mode);
        cfg.laptop_replication = false;
        cfg.high_water_bytes = 1;
        cfg.low_water_bytes = 0;
        let test = build(cfg).await;
        let bytes = payload(6_000, 20);
        let manifest = test
            .node
            .gateway()
            .put(PutRequest::new(bytes.clone(), ReachLevel::Private, "alice"))
            .await
            .unwrap();

        // No placement pass has run yet
        let report = test.node.eviction().run_once().await.unwrap();
        assert!(report.evicted.is_empty(), "{} evicted the only copy", mode);
        let record = test.node.store().record(&manifest.digest).await.unwrap();
        assert!(record.retain);
        assert_eq!(record.local_shards.len(), 7);

        if mode == SovereigntyMode::Network {
            let served = test
                .node
                .gateway()
                .serve(&manifest.digest, Some("alice"))
                .await
                .unwrap();
            assert_eq!(served.bytes, bytes);
        }
    }
}

#[tokio::test]
async fn test_held_shards_yield_to_budget() {
    let mut cfg = config(SovereigntyMode::Network);
    cfg.high_water_bytes = 10_000;
    cfg.low_water_bytes = 5_000;
    let test = build(cfg).await;
    let gateway = test.node.gateway();

    let mut accepted = 0;
    let mut refused = 0;
    for seed in 0..20u8 {
        let bytes = vec![seed; 1_000];
        let digest = CryptoUtils::content_hash(&bytes);
        match gateway.accept_shard(&digest, &bytes, Some("node-b")).await {
            Ok(()) => accepted += 1,
            Err(EngineError::InsufficientStorage { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(refused, 10);
    assert_eq!(test.node.store().used_bytes(), 10_000);

    // Own writes are not refused; they push usage over the mark instead
    let commons = gateway
        .put(PutRequest::new(payload(4_000, 21), ReachLevel::Commons, "alice"))
        .await
        .unwrap();
    assert!(test.node.store().used_bytes() > 10_000);

    let report = test.node.eviction().run_once().await.unwrap();
    assert_eq!(report.released_held.len(), 10);
    assert_eq!(report.evicted, vec![commons.digest.clone()]);
    assert!(report.used_after < 5_000);
    assert!(test.node.store().held_shards().await.is_empty());

    let bytes = vec![99u8; 1_000];
    gateway
        .accept_shard(&CryptoUtils::content_hash(&bytes), &bytes, Some("node-b"))
        .await
        .unwrap();
}

async fn start_node(
    cfg: NodeConfig,
    backend: &Arc<MemoryStorage>,
    keys: &Arc<KeyManager>,
    oracle: &Arc<StaticTrustOracle>,
) -> Node {
    Node::with_components(
        cfg,
        Arc::clone(backend) as Arc<dyn Storage>,
        Arc::clone(keys),
        Arc::new(MemoryTransport::new()) as Arc<dyn ShardTransport>,
        Arc::clone(oracle) as SharedOracle,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_members_configured_after_restart_join_cluster_key() {
    let backend = Arc::new(MemoryStorage::new());
    let keys = Arc::new(KeyManager::in_memory());
    let oracle = Arc::new(StaticTrustOracle::new());
    oracle.set_tier("bob", "alice", TrustTier::Family).await;

    let mut first = config(SovereigntyMode::Network);
    first.family_members = vec!["alice".to_string()];
    first.cluster_members = Vec::new();
    let node = start_node(first, &backend, &keys, &oracle).await;
    let bytes = payload(5_000, 22);
    let manifest = node
        .gateway()
        .put(PutRequest::new(bytes.clone(), ReachLevel::Local, "alice"))
        .await
        .unwrap();
    let key_id = keys.cluster_info().unwrap().unwrap().key_id;
    assert!(matches!(
        node.gateway().serve(&manifest.digest, Some("bob")).await,
        Err(EngineError::KeyUnavailable)
    ));
    drop(node);

    // bob and carol were added to the configuration in the meantime
    let node = start_node(config(SovereigntyMode::Network), &backend, &keys, &oracle).await;
    let info = keys.cluster_info().unwrap().unwrap();
    assert_eq!(info.key_id, key_id);
    assert!(info.members.contains("bob"));
    assert!(info.members.contains("carol"));

    let served = node.gateway().serve(&manifest.digest, Some("bob")).await.unwrap();
    assert_eq!(served.bytes, bytes);
}
