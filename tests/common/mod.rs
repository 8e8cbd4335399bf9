#![allow(dead_code)]

use std::sync::Arc;

use reach_store::config::{NodeConfig, PeerConfig};
use reach_store::crypto::KeyManager;
use reach_store::distributed::{MemoryTransport, ShardTransport};
use reach_store::policy::{SharedOracle, StaticTrustOracle};
use reach_store::sovereignty::SovereigntyMode;
use reach_store::storage::{MemoryStorage, Storage};
use reach_store::Node;

/// A node wired to in-memory storage, simulated peers and a static oracle
pub struct TestNode {
    pub node: Node,
    pub backend: Arc<MemoryStorage>,
    pub transport: Arc<MemoryTransport>,
    pub oracle: Arc<StaticTrustOracle>,
}

/// alice and bob are family, carol is in the wider cluster
pub fn config(mode: SovereigntyMode) -> NodeConfig {
    let mut config = NodeConfig::new("node-a");
    config.sovereignty = mode;
    config.family_members = vec!["alice".to_string(), "bob".to_string()];
    config.cluster_members = vec!["carol".to_string()];
    config.placement_max_attempts = 2;
    config.peer_timeout_ms = 500;
    config
}

pub fn with_peers(mut config: NodeConfig, peers: &[&str]) -> NodeConfig {
    config.peers = peers
        .iter()
        .map(|id| PeerConfig {
            peer_id: id.to_string(),
            address: format!("mem://{}", id),
        })
        .collect();
    config
}

pub async fn build(config: NodeConfig) -> TestNode {
    let backend = Arc::new(MemoryStorage::new());
    let transport = Arc::new(MemoryTransport::new());
    let oracle = Arc::new(StaticTrustOracle::new());
    let node = Node::with_components(
        config,
        Arc::clone(&backend) as Arc<dyn Storage>,
        Arc::new(KeyManager::in_memory()),
        Arc::clone(&transport) as Arc<dyn ShardTransport>,
        Arc::clone(&oracle) as SharedOracle,
    )
    .await
    .expect("node should assemble");
    TestNode {
        node,
        backend,
        transport,
        oracle,
    }
}

/// Deterministic, non-repeating payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 13) as u8 ^ seed)
        .collect()
}
