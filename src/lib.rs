//! Reach Store
//!
//! Content-addressed, erasure-coded blob storage whose encryption, replication,
//! eviction and delivery are all governed by each blob's declared reach level.
//! Every read passes a node-level sovereignty gate and a content-level reach
//! gate before any shard is touched.

pub mod config;
pub mod crypto;
pub mod distributed;
pub mod erasure;
pub mod error;
pub mod eviction;
pub mod gateway;
pub mod http;
pub mod node;
pub mod policy;
pub mod sovereignty;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::NodeConfig;
pub use error::{EngineError, EngineResult};
pub use gateway::{DeliveryGateway, HealthReport, PutRequest, ServedBlob};
pub use node::Node;
pub use types::{Manifest, ReachLevel, TrustTier};

/// Module version information
pub mod version {
    /// The current version of the library
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_is_available() {
        assert!(!super::version::VERSION.is_empty());
    }
}
