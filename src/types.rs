//! Core records shared by every subsystem: reach levels, trust tiers,
//! shards, manifests and the per-blob metadata record.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoUtils, EncryptionMetadata};

/// Opaque identity of a person/agent, as issued by the identity layer
pub type IdentityId = String;

/// Opaque identity of a storage node
pub type PeerId = String;

/// Returned when a reach level or trust tier name is not recognised
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown value: {0}")]
pub struct ParseLevelError(pub String);

/// Declared breadth of the audience allowed to hold or request content.
///
/// Variants are declared narrowest first, so `Ord` follows widening reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachLevel {
    Private,
    Invited,
    Local,
    Neighborhood,
    Municipal,
    Bioregional,
    Regional,
    Commons,
}

impl ReachLevel {
    pub const ALL: [ReachLevel; 8] = [
        ReachLevel::Private,
        ReachLevel::Invited,
        ReachLevel::Local,
        ReachLevel::Neighborhood,
        ReachLevel::Municipal,
        ReachLevel::Bioregional,
        ReachLevel::Regional,
        ReachLevel::Commons,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReachLevel::Private => "private",
            ReachLevel::Invited => "invited",
            ReachLevel::Local => "local",
            ReachLevel::Neighborhood => "neighborhood",
            ReachLevel::Municipal => "municipal",
            ReachLevel::Bioregional => "bioregional",
            ReachLevel::Regional => "regional",
            ReachLevel::Commons => "commons",
        }
    }

    /// Private and invited content is addressed to named identities rather
    /// than to a relationship tier.
    pub fn is_addressed(&self) -> bool {
        matches!(self, ReachLevel::Private | ReachLevel::Invited)
    }
}

impl fmt::Display for ReachLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReachLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReachLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

/// Closeness between a requester and a resource owner, as reported by the
/// peer-trust oracle.
///
/// Variants are declared from the most distant to the closest relationship,
/// so `a >= b` reads as "a is at least as trusted as b".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Network,
    Community,
    Extended,
    Family,
    Invited,
    #[serde(rename = "self")]
    Owner,
}

impl TrustTier {
    pub const ALL: [TrustTier; 6] = [
        TrustTier::Network,
        TrustTier::Community,
        TrustTier::Extended,
        TrustTier::Family,
        TrustTier::Invited,
        TrustTier::Owner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Network => "network",
            TrustTier::Community => "community",
            TrustTier::Extended => "extended",
            TrustTier::Family => "family",
            TrustTier::Invited => "invited",
            TrustTier::Owner => "self",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustTier::ALL
            .iter()
            .copied()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

/// Which key family protects a blob at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Derivable only with the beneficiary's private key
    Beneficiary,
    /// Per-blob symmetric key wrapped for each invitee
    SharedInvite,
    /// Long-lived symmetric key of the local trust cluster
    Cluster,
    /// Stored in the clear
    Cleartext,
}

/// One erasure-coded fragment of a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl Shard {
    pub fn new(index: usize, bytes: Vec<u8>) -> Self {
        let digest = CryptoUtils::content_hash(&bytes);
        Self { index, digest, bytes }
    }

    /// Check the bytes still hash to the recorded digest
    pub fn verify(&self) -> bool {
        CryptoUtils::verify_content_hash(&self.bytes, &self.digest)
    }
}

/// Shard layout of a blob; enough to rebuild it from any `k` shards (and the
/// key, when encrypted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Digest of the plaintext
    pub digest: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// Size of the (possibly encrypted) byte stream fed to the codec
    pub encoded_size: u64,
    pub shard_size: u64,
    pub shard_digests: Vec<String>,
    pub k: u8,
    pub m: u8,
    pub encryption: EncryptionMetadata,
}

impl Manifest {
    pub fn total_shards(&self) -> usize {
        self.shard_digests.len()
    }

    pub fn shard_index(&self, shard_digest: &str) -> Option<usize> {
        self.shard_digests.iter().position(|d| d == shard_digest)
    }
}

/// Everything the node persists about one blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub manifest: Manifest,
    pub mime_type: String,
    pub reach: ReachLevel,
    pub owner: IdentityId,
    pub beneficiary: Option<IdentityId>,
    #[serde(default)]
    pub invited: BTreeSet<IdentityId>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Shard indices whose bytes live on this node
    #[serde(default)]
    pub local_shards: BTreeSet<usize>,
    /// Last local copy may not be evicted
    #[serde(default)]
    pub retain: bool,
    /// Local integrity failure that could not be repaired
    #[serde(default)]
    pub degraded: bool,
}

impl BlobRecord {
    pub fn digest(&self) -> &str {
        &self.manifest.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reach_order_widens() {
        for pair in ReachLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!("Commons".parse::<ReachLevel>().unwrap(), ReachLevel::Commons);
        assert!("galaxy".parse::<ReachLevel>().is_err());
    }

    #[test]
    fn test_trust_tier_names() {
        assert_eq!("self".parse::<TrustTier>().unwrap(), TrustTier::Owner);
        assert!(TrustTier::Owner > TrustTier::Family);
        assert!(TrustTier::Network < TrustTier::Community);
        let json = serde_json::to_string(&TrustTier::Owner).unwrap();
        assert_eq!(json, "\"self\"");
    }

    #[test]
    fn test_shard_verification() {
        let mut shard = Shard::new(0, b"fragment".to_vec());
        assert!(shard.verify());
        shard.bytes[0] ^= 0xff;
        assert!(!shard.verify());
    }
}
