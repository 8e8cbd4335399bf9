//! Node-level decision on whether to serve anyone at all, independent of
//! what content is being asked for.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::IdentityId;

/// How widely this node is willing to act as a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SovereigntyMode {
    /// Personal device; serves nothing
    #[default]
    Laptop,
    /// Always-on home device serving the family
    HomeNode,
    /// Member of a household/neighbour cluster
    HomeCluster,
    /// Public infrastructure node
    Network,
}

impl SovereigntyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SovereigntyMode::Laptop => "laptop",
            SovereigntyMode::HomeNode => "home_node",
            SovereigntyMode::HomeCluster => "home_cluster",
            SovereigntyMode::Network => "network",
        }
    }

    pub const ALL: [SovereigntyMode; 4] = [
        SovereigntyMode::Laptop,
        SovereigntyMode::HomeNode,
        SovereigntyMode::HomeCluster,
        SovereigntyMode::Network,
    ];
}

impl fmt::Display for SovereigntyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node's serve/no-serve gate
#[derive(Debug, Clone)]
pub struct SovereigntyGate {
    mode: SovereigntyMode,
    family: BTreeSet<IdentityId>,
    cluster: BTreeSet<IdentityId>,
    /// A laptop may still push its own shards out to custodians
    laptop_replicates: bool,
}

impl SovereigntyGate {
    pub fn new(
        mode: SovereigntyMode,
        family: impl IntoIterator<Item = IdentityId>,
        cluster: impl IntoIterator<Item = IdentityId>,
    ) -> Self {
        Self {
            mode,
            family: family.into_iter().collect(),
            cluster: cluster.into_iter().collect(),
            laptop_replicates: true,
        }
    }

    pub fn with_laptop_replication(mut self, enabled: bool) -> Self {
        self.laptop_replicates = enabled;
        self
    }

    pub fn mode(&self) -> SovereigntyMode {
        self.mode
    }

    /// Whether this node serves `requester` anything at all
    pub fn should_serve_at_all(&self, requester: Option<&str>) -> bool {
        let allowed = match (self.mode, requester) {
            (SovereigntyMode::Laptop, _) => false,
            (SovereigntyMode::Network, _) => true,
            (SovereigntyMode::HomeNode, Some(id)) => self.family.contains(id),
            (SovereigntyMode::HomeCluster, Some(id)) => {
                self.cluster.contains(id) || self.family.contains(id)
            }
            (_, None) => false,
        };
        debug!(
            "Sovereignty gate ({}) for {:?}: {}",
            self.mode, requester, allowed
        );
        allowed
    }

    /// Whether this node answers shard traffic from other nodes
    pub fn serves_peers(&self) -> bool {
        self.mode != SovereigntyMode::Laptop
    }

    /// Whether locally written blobs are pushed out to custodians
    pub fn should_replicate(&self) -> bool {
        match self.mode {
            SovereigntyMode::Laptop => self.laptop_replicates,
            _ => true,
        }
    }

    pub fn is_always_on(&self) -> bool {
        self.mode != SovereigntyMode::Laptop
    }
}
