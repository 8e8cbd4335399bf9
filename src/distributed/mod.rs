//! Custodian placement and replication across peers

pub mod custodian;
pub mod peer;
pub mod replication;
pub mod transport;

pub use custodian::{CustodianRecord, CustodianTable, ProbeOutcome, ABANDON_AFTER, FAILURE_THRESHOLD};
pub use peer::StoragePeer;
pub use replication::{
    PlacementReport, ProbeReport, ReplicationConfig, ReplicationError, ReplicationManager,
};
pub use transport::{HttpShardTransport, MemoryTransport, ShardTransport, TransportError, PEER_ID_HEADER};
