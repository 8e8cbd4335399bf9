//! Caller-facing error taxonomy shared by the gateway, sync engine and HTTP
//! surface.

use thiserror::Error;

use crate::crypto::KeyError;
use crate::distributed::ReplicationError;
use crate::erasure::ErasureError;
use crate::storage::StorageError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Gate failure. Deliberately carries no reason.
    #[error("Forbidden")]
    Forbidden,

    #[error("Insufficient shards: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    #[error("Shard {index} failed integrity check")]
    CorruptShard { index: usize },

    #[error("Key unavailable for this requester")]
    KeyUnavailable,

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Insufficient storage: {needed} bytes over budget")]
    InsufficientStorage { needed: u64 },

    #[error("Policy conflict: {0}")]
    PolicyConflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Replication error: {0}")]
    Replication(ReplicationError),

    #[error("Sync error: {0}")]
    Sync(SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<ErasureError> for EngineError {
    fn from(err: ErasureError) -> Self {
        match err {
            ErasureError::InsufficientShards { needed, available } => {
                EngineError::InsufficientShards { needed, available }
            }
            ErasureError::CorruptShard(index) => EngineError::CorruptShard { index },
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<KeyError> for EngineError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::KeyUnavailable(_) | KeyError::Decryption(_) => EngineError::KeyUnavailable,
            KeyError::UnknownIdentity(id) => {
                EngineError::InvalidRequest(format!("no public key known for {}", id))
            }
            KeyError::NoClusterKey => {
                EngineError::InvalidRequest("no cluster key installed".to_string())
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<ReplicationError> for EngineError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Timeout(peer) => EngineError::NetworkTimeout(peer),
            ReplicationError::Storage(e) => EngineError::Storage(e),
            other => EngineError::Replication(other),
        }
    }
}

impl From<SyncError> for EngineError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(id) => EngineError::NotFound(id),
            SyncError::InvalidId(id) => EngineError::InvalidRequest(format!("invalid id: {}", id)),
            SyncError::Storage(e) => EngineError::Storage(e),
            other => EngineError::Sync(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_reveals_nothing() {
        assert_eq!(EngineError::Forbidden.to_string(), "Forbidden");
    }

    #[test]
    fn test_subsystem_mappings() {
        let err: EngineError = ErasureError::InsufficientShards {
            needed: 4,
            available: 2,
        }
        .into();
        assert!(matches!(
            err,
            EngineError::InsufficientShards {
                needed: 4,
                available: 2
            }
        ));

        let err: EngineError = KeyError::KeyUnavailable("bob".to_string()).into();
        assert!(matches!(err, EngineError::KeyUnavailable));

        let err: EngineError = SyncError::NotFound("app/doc".to_string()).into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
