use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Weight given to the newest probe in the health average
const HEALTH_ALPHA: f32 = 0.2;

/// Information about a storage peer in the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePeer {
    /// Unique identifier for the peer
    pub peer_id: PeerId,
    /// Network address of the peer, e.g. `http://10.0.0.2:8090`
    pub address: String,
    /// Moving average of probe and placement success, 0.0 to 1.0
    pub health: f32,
    /// Number of shards this node has placed with the peer
    pub load: u64,
    /// Last observed round-trip in milliseconds
    pub latency_ms: u32,
}

impl StoragePeer {
    /// Create a new storage peer; unknown peers start fully healthy
    pub fn new(peer_id: impl Into<PeerId>, address: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            health: 1.0,
            load: 0,
            latency_ms: 0,
        }
    }

    /// Fold one probe or placement outcome into the health average
    pub fn record_outcome(&mut self, success: bool, latency_ms: Option<u32>) {
        let sample = if success { 1.0 } else { 0.0 };
        self.health = (1.0 - HEALTH_ALPHA) * self.health + HEALTH_ALPHA * sample;
        if let Some(latency) = latency_ms {
            self.latency_ms = latency;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health >= 0.5
    }

    /// Placement order: healthier first, then less loaded, then by id for determinism
    pub fn placement_order(a: &StoragePeer, b: &StoragePeer) -> Ordering {
        b.health
            .partial_cmp(&a.health)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.load.cmp(&b.load))
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_tracks_outcomes() {
        let mut peer = StoragePeer::new("node1", "http://127.0.0.1:8000");
        assert!(peer.is_healthy());

        for _ in 0..5 {
            peer.record_outcome(false, None);
        }
        assert!(!peer.is_healthy());

        for _ in 0..10 {
            peer.record_outcome(true, Some(12));
        }
        assert!(peer.is_healthy());
        assert_eq!(peer.latency_ms, 12);
    }

    #[test]
    fn test_placement_order() {
        let mut flaky = StoragePeer::new("a", "x");
        flaky.record_outcome(false, None);
        let mut busy = StoragePeer::new("b", "y");
        busy.load = 10;
        let idle = StoragePeer::new("c", "z");

        let mut peers = vec![flaky, busy, idle];
        peers.sort_by(StoragePeer::placement_order);
        let order: Vec<_> = peers.iter().map(|p| p.peer_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
