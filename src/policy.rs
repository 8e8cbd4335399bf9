//! Reach policy: the closed table mapping each reach level to its trust
//! floor, key scope and eviction priority, plus the servability check.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{IdentityId, KeyScope, ReachLevel, TrustTier};

/// One row of the reach policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachPolicy {
    pub reach: ReachLevel,
    /// Least trusted tier that may hold or request content; `None` admits anyone
    pub trust_floor: Option<TrustTier>,
    pub key_scope: KeyScope,
    /// Lower values are evicted first
    pub eviction_priority: u8,
}

impl ReachPolicy {
    pub fn for_level(reach: ReachLevel) -> Self {
        let (trust_floor, key_scope, eviction_priority) = match reach {
            ReachLevel::Private => (Some(TrustTier::Owner), KeyScope::Beneficiary, 7),
            ReachLevel::Invited => (Some(TrustTier::Invited), KeyScope::SharedInvite, 6),
            ReachLevel::Local => (Some(TrustTier::Family), KeyScope::Cluster, 5),
            ReachLevel::Neighborhood => (Some(TrustTier::Extended), KeyScope::Cleartext, 4),
            ReachLevel::Municipal => (Some(TrustTier::Community), KeyScope::Cleartext, 3),
            ReachLevel::Bioregional => (Some(TrustTier::Community), KeyScope::Cleartext, 2),
            ReachLevel::Regional => (Some(TrustTier::Network), KeyScope::Cleartext, 1),
            ReachLevel::Commons => (None, KeyScope::Cleartext, 0),
        };
        Self {
            reach,
            trust_floor,
            key_scope,
            eviction_priority,
        }
    }

    pub fn encrypts(&self) -> bool {
        self.key_scope != KeyScope::Cleartext
    }

    /// Whether a peer or requester at `tier` clears this row's floor
    pub fn admits(&self, tier: Option<TrustTier>) -> bool {
        match self.trust_floor {
            None => true,
            Some(floor) => tier.map(|t| t >= floor).unwrap_or(false),
        }
    }
}

/// Who a blob belongs to and who it is addressed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContext {
    pub owner: IdentityId,
    pub beneficiary: Option<IdentityId>,
    #[serde(default)]
    pub invited: BTreeSet<IdentityId>,
}

impl OwnerContext {
    pub fn new(owner: impl Into<IdentityId>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// The declared beneficiary, defaulting to the owner
    pub fn beneficiary(&self) -> &str {
        self.beneficiary.as_deref().unwrap_or(&self.owner)
    }
}

/// Outcome of classifying a request against the policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub encrypt: bool,
    pub key_scope: KeyScope,
    pub replication_trust_floor: Option<TrustTier>,
    pub eviction_priority: u8,
    pub servable: bool,
}

/// Classify a request. `tier` is the oracle's answer for (requester, owner)
/// and is only consulted for reach levels above `invited`.
pub fn classify(
    reach: ReachLevel,
    requester: Option<&str>,
    ctx: &OwnerContext,
    tier: Option<TrustTier>,
) -> Decision {
    let policy = ReachPolicy::for_level(reach);
    let servable = match reach {
        ReachLevel::Private => requester == Some(ctx.beneficiary()),
        ReachLevel::Invited => requester
            .map(|id| ctx.invited.contains(id))
            .unwrap_or(false),
        _ => policy.admits(tier),
    };

    Decision {
        encrypt: policy.encrypts(),
        key_scope: policy.key_scope,
        replication_trust_floor: policy.trust_floor,
        eviction_priority: policy.eviction_priority,
        servable,
    }
}

/// External source of relationship closeness between two identities
#[async_trait]
pub trait TrustOracle: Send + Sync {
    /// Tier of `requester` relative to `owner`; `None` when unrelated
    async fn trust_tier(&self, requester: &str, owner: &str) -> Option<TrustTier>;
}

/// Classify a request, asking `oracle` only when the reach level needs it
pub async fn evaluate(
    oracle: &dyn TrustOracle,
    reach: ReachLevel,
    requester: Option<&str>,
    ctx: &OwnerContext,
) -> Decision {
    let tier = match (reach.is_addressed(), requester) {
        (false, Some(requester)) => oracle.trust_tier(requester, &ctx.owner).await,
        _ => None,
    };
    let decision = classify(reach, requester, ctx, tier);
    debug!(
        "Reach decision for {:?} on {} content: servable={}",
        requester, reach, decision.servable
    );
    decision
}

/// Table-backed oracle for tests and statically configured deployments
#[derive(Debug, Default)]
pub struct StaticTrustOracle {
    tiers: RwLock<HashMap<(IdentityId, IdentityId), TrustTier>>,
}

impl StaticTrustOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_tier(&self, requester: &str, owner: &str, tier: TrustTier) {
        self.tiers
            .write()
            .await
            .insert((requester.to_string(), owner.to_string()), tier);
    }
}

#[async_trait]
impl TrustOracle for StaticTrustOracle {
    async fn trust_tier(&self, requester: &str, owner: &str) -> Option<TrustTier> {
        if requester == owner {
            return Some(TrustTier::Owner);
        }
        self.tiers
            .read()
            .await
            .get(&(requester.to_string(), owner.to_string()))
            .copied()
    }
}

#[derive(Debug, Deserialize)]
struct TierResponse {
    tier: Option<TrustTier>,
}

/// Oracle backed by the identity layer's HTTP endpoint:
/// `GET {base}/trust?requester=..&owner=..` answering `{"tier": "family"}`
pub struct HttpTrustOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTrustOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl TrustOracle for HttpTrustOracle {
    async fn trust_tier(&self, requester: &str, owner: &str) -> Option<TrustTier> {
        if requester == owner {
            return Some(TrustTier::Owner);
        }
        let url = format!("{}/trust", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("requester", requester), ("owner", owner)])
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<TierResponse>().await {
                Ok(body) => body.tier,
                Err(e) => {
                    warn!("Trust oracle returned an unreadable body: {}", e);
                    None
                }
            },
            Ok(resp) => {
                debug!("Trust oracle answered {} for {}", resp.status(), requester);
                None
            }
            Err(e) => {
                // An unreachable oracle denies rather than guesses
                warn!("Trust oracle unreachable: {}", e);
                None
            }
        }
    }
}

/// Convenience helpers over any oracle
#[async_trait]
pub trait TrustOracleExt: TrustOracle {
    /// Whether `peer` may receive shards of content at `reach` owned by `owner`
    async fn peer_admitted(&self, peer: &str, owner: &str, reach: ReachLevel) -> bool {
        let policy = ReachPolicy::for_level(reach);
        if policy.trust_floor.is_none() {
            return true;
        }
        policy.admits(self.trust_tier(peer, owner).await)
    }
}

impl<T: TrustOracle + ?Sized> TrustOracleExt for T {}

/// Shared handle used throughout the node
pub type SharedOracle = Arc<dyn TrustOracle>;
