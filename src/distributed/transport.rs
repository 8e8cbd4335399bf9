//! Moving shard bytes between nodes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use thiserror::Error;

use super::peer::StoragePeer;
use crate::types::PeerId;

/// Header carrying the sending node's id on peer traffic
pub const PEER_ID_HEADER: &str = "x-peer-id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request to {0} timed out")]
    Timeout(PeerId),

    #[error("Peer {0} unreachable: {1}")]
    Unreachable(PeerId, String),

    #[error("Shard {0} not held by peer")]
    NotFound(String),

    #[error("Peer {0} rejected the request: {1}")]
    Rejected(PeerId, String),
}

/// Shard exchange with a remote custodian
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Push a shard to `peer`; success means the peer acknowledged storing it
    async fn store_shard(
        &self,
        peer: &StoragePeer,
        shard_digest: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    async fn fetch_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<Vec<u8>, TransportError>;

    /// Whether `peer` still holds the shard
    async fn probe_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<bool, TransportError>;

    /// Tell `peer` this node no longer needs the shard kept
    async fn retract_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<(), TransportError>;
}

/// Transport over the peers' HTTP shard endpoints
pub struct HttpShardTransport {
    node_id: PeerId,
    client: reqwest::Client,
}

impl HttpShardTransport {
    pub fn new(node_id: impl Into<PeerId>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            node_id: node_id.into(),
            client,
        })
    }

    fn url(peer: &StoragePeer, shard_digest: &str) -> String {
        format!("{}/shard/{}", peer.address.trim_end_matches('/'), shard_digest)
    }

    fn map_error(peer: &StoragePeer, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(peer.peer_id.clone())
        } else {
            TransportError::Unreachable(peer.peer_id.clone(), err.to_string())
        }
    }
}

#[async_trait]
impl ShardTransport for HttpShardTransport {
    async fn store_shard(
        &self,
        peer: &StoragePeer,
        shard_digest: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(Self::url(peer, shard_digest))
            .header(PEER_ID_HEADER, &self.node_id)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| Self::map_error(peer, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(
                peer.peer_id.clone(),
                format!("{} - {}", status, body),
            ));
        }
        Ok(())
    }

    async fn fetch_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(Self::url(peer, shard_digest))
            .header(PEER_ID_HEADER, &self.node_id)
            .send()
            .await
            .map_err(|e| Self::map_error(peer, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(TransportError::NotFound(shard_digest.to_string())),
            status if status.is_success() => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| Self::map_error(peer, e)),
            status => Err(TransportError::Rejected(
                peer.peer_id.clone(),
                status.as_u16().to_string(),
            )),
        }
    }

    async fn probe_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<bool, TransportError> {
        let response = self
            .client
            .head(Self::url(peer, shard_digest))
            .header(PEER_ID_HEADER, &self.node_id)
            .send()
            .await
            .map_err(|e| Self::map_error(peer, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(TransportError::Rejected(
                peer.peer_id.clone(),
                status.as_u16().to_string(),
            )),
        }
    }

    async fn retract_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(Self::url(peer, shard_digest))
            .header(PEER_ID_HEADER, &self.node_id)
            .send()
            .await
            .map_err(|e| Self::map_error(peer, e))?;

        match response.status() {
            // Already gone is as good as released
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(TransportError::Rejected(
                peer.peer_id.clone(),
                status.as_u16().to_string(),
            )),
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedPeer {
    shards: HashMap<String, Vec<u8>>,
    offline: bool,
    fail_next: u32,
    latency: Option<Duration>,
}

/// In-process network of simulated peers, for tests and single-process demos
#[derive(Debug, Default)]
pub struct MemoryTransport {
    peers: DashMap<PeerId, SimulatedPeer>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, peer_id: &str, offline: bool) {
        self.peers.entry(peer_id.to_string()).or_default().offline = offline;
    }

    /// Make the next `count` requests to the peer fail as unreachable
    pub fn fail_next(&self, peer_id: &str, count: u32) {
        self.peers.entry(peer_id.to_string()).or_default().fail_next = count;
    }

    pub fn set_latency(&self, peer_id: &str, latency: Duration) {
        self.peers.entry(peer_id.to_string()).or_default().latency = Some(latency);
    }

    /// Shard digests the peer currently holds
    pub fn held(&self, peer_id: &str) -> Vec<String> {
        let mut held: Vec<String> = self
            .peers
            .get(peer_id)
            .map(|p| p.shards.keys().cloned().collect())
            .unwrap_or_default();
        held.sort();
        held
    }

    /// Drop a shard from the peer, as if its disk lost it
    pub fn forget(&self, peer_id: &str, shard_digest: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.shards.remove(shard_digest);
        }
    }

    /// Flip a byte of a held shard
    pub fn corrupt(&self, peer_id: &str, shard_digest: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            if let Some(bytes) = peer.shards.get_mut(shard_digest) {
                if let Some(first) = bytes.first_mut() {
                    *first ^= 0xff;
                }
            }
        }
    }

    async fn enter(&self, peer_id: &str) -> Result<(), TransportError> {
        let latency = self.peers.get(peer_id).and_then(|p| p.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut peer = self.peers.entry(peer_id.to_string()).or_default();
        if peer.offline {
            return Err(TransportError::Unreachable(
                peer_id.to_string(),
                "offline".to_string(),
            ));
        }
        if peer.fail_next > 0 {
            peer.fail_next -= 1;
            return Err(TransportError::Unreachable(
                peer_id.to_string(),
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardTransport for MemoryTransport {
    async fn store_shard(
        &self,
        peer: &StoragePeer,
        shard_digest: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        self.enter(&peer.peer_id).await?;
        self.peers
            .entry(peer.peer_id.clone())
            .or_default()
            .shards
            .insert(shard_digest.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn fetch_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<Vec<u8>, TransportError> {
        self.enter(&peer.peer_id).await?;
        self.peers
            .get(&peer.peer_id)
            .and_then(|p| p.shards.get(shard_digest).cloned())
            .ok_or_else(|| TransportError::NotFound(shard_digest.to_string()))
    }

    async fn probe_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<bool, TransportError> {
        self.enter(&peer.peer_id).await?;
        Ok(self
            .peers
            .get(&peer.peer_id)
            .map(|p| p.shards.contains_key(shard_digest))
            .unwrap_or(false))
    }

    async fn retract_shard(&self, peer: &StoragePeer, shard_digest: &str) -> Result<(), TransportError> {
        self.enter(&peer.peer_id).await?;
        if let Some(mut simulated) = self.peers.get_mut(&peer.peer_id) {
            simulated.shards.remove(shard_digest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let transport = MemoryTransport::new();
        let peer = StoragePeer::new("p1", "mem://p1");

        transport.store_shard(&peer, "sha256-aa", b"bytes").await.unwrap();
        assert!(transport.probe_shard(&peer, "sha256-aa").await.unwrap());
        assert_eq!(transport.fetch_shard(&peer, "sha256-aa").await.unwrap(), b"bytes");
        assert_eq!(
            transport.fetch_shard(&peer, "sha256-bb").await,
            Err(TransportError::NotFound("sha256-bb".to_string()))
        );

        transport.retract_shard(&peer, "sha256-aa").await.unwrap();
        assert!(!transport.probe_shard(&peer, "sha256-aa").await.unwrap());
        // Retracting twice is harmless
        transport.retract_shard(&peer, "sha256-aa").await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = MemoryTransport::new();
        let peer = StoragePeer::new("p1", "mem://p1");

        transport.fail_next("p1", 1);
        assert!(transport.store_shard(&peer, "sha256-aa", b"x").await.is_err());
        assert!(transport.store_shard(&peer, "sha256-aa", b"x").await.is_ok());

        transport.set_offline("p1", true);
        assert!(matches!(
            transport.probe_shard(&peer, "sha256-aa").await,
            Err(TransportError::Unreachable(_, _))
        ));
    }
}
