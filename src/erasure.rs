//! Reed-Solomon erasure coding of blobs into `k` data and `m` parity shards.
//!
//! Any `k` of the `k + m` shards are sufficient to rebuild the input. Each
//! shard carries its own content digest, which is checked before use.

use std::collections::BTreeMap;

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::Shard;

/// Upper bound imposed by GF(2^8)
pub const MAX_TOTAL_SHARDS: usize = 255;

/// Errors raised while encoding or rebuilding a blob
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ErasureError {
    #[error("Invalid erasure parameters: {0}")]
    InvalidParameters(String),

    #[error("Insufficient shards: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    #[error("Shard {0} failed integrity check")]
    CorruptShard(usize),

    #[error("Shard index {index} out of range for {total} shards")]
    ShardOutOfRange { index: usize, total: usize },

    #[error("Shard {index} has length {actual}, expected {expected}")]
    ShardLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),
}

/// Data/parity split used for every blob the node writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureParams {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl Default for ErasureParams {
    fn default() -> Self {
        Self {
            data_shards: 4,
            parity_shards: 3,
        }
    }
}

impl ErasureParams {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, ErasureError> {
        let params = Self {
            data_shards,
            parity_shards,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn total(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn validate(&self) -> Result<(), ErasureError> {
        if self.data_shards == 0 {
            return Err(ErasureError::InvalidParameters(
                "data shard count must be at least 1".to_string(),
            ));
        }
        if self.total() > MAX_TOTAL_SHARDS {
            return Err(ErasureError::InvalidParameters(format!(
                "{} total shards exceeds the limit of {}",
                self.total(),
                MAX_TOTAL_SHARDS
            )));
        }
        Ok(())
    }

    /// Size of each shard for an input of `len` bytes
    pub fn shard_size(&self, len: usize) -> usize {
        let size = (len + self.data_shards - 1) / self.data_shards;
        size.max(1)
    }
}

/// Stateless codec for one `(k, m)` configuration
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    params: ErasureParams,
}

impl ErasureCodec {
    pub fn new(params: ErasureParams) -> Result<Self, ErasureError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> ErasureParams {
        self.params
    }

    fn reed_solomon(&self) -> Result<ReedSolomon, ErasureError> {
        ReedSolomon::new(self.params.data_shards, self.params.parity_shards)
            .map_err(|e| ErasureError::InvalidParameters(format!("{:?}", e)))
    }

    /// Split `data` into `k` zero-padded data shards and compute `m` parity
    /// shards. Returns exactly `k + m` shards in index order.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Shard>, ErasureError> {
        let k = self.params.data_shards;
        let shard_size = self.params.shard_size(data.len());

        let mut padded = data.to_vec();
        padded.resize(shard_size * k, 0);

        let mut pieces: Vec<Vec<u8>> = padded.chunks(shard_size).map(|c| c.to_vec()).collect();

        if self.params.parity_shards > 0 {
            pieces.extend((0..self.params.parity_shards).map(|_| vec![0u8; shard_size]));
            self.reed_solomon()?
                .encode(&mut pieces)
                .map_err(|e| ErasureError::Reconstruction(format!("{:?}", e)))?;
        }

        debug!(
            "Encoded {} bytes into {}+{} shards of {} bytes",
            data.len(),
            k,
            self.params.parity_shards,
            shard_size
        );

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(index, bytes)| Shard::new(index, bytes))
            .collect())
    }

    /// Rebuild the original `original_len` bytes from any `k` distinct,
    /// verified shards. Duplicate indices are ignored; any shard whose bytes
    /// do not hash to its digest fails the whole call.
    pub fn decode(&self, shards: &[Shard], original_len: usize) -> Result<Vec<u8>, ErasureError> {
        let k = self.params.data_shards;
        let total = self.params.total();
        let shard_size = self.params.shard_size(original_len);

        let mut by_index: BTreeMap<usize, &Shard> = BTreeMap::new();
        for shard in shards {
            if shard.index >= total {
                return Err(ErasureError::ShardOutOfRange {
                    index: shard.index,
                    total,
                });
            }
            if !shard.verify() {
                return Err(ErasureError::CorruptShard(shard.index));
            }
            if shard.bytes.len() != shard_size {
                return Err(ErasureError::ShardLength {
                    index: shard.index,
                    expected: shard_size,
                    actual: shard.bytes.len(),
                });
            }
            by_index.entry(shard.index).or_insert(shard);
        }

        if by_index.len() < k {
            return Err(ErasureError::InsufficientShards {
                needed: k,
                available: by_index.len(),
            });
        }

        let mut slots: Vec<Option<Vec<u8>>> = (0..total)
            .map(|i| by_index.get(&i).map(|s| s.bytes.clone()))
            .collect();

        let all_data_present = slots[..k].iter().all(Option::is_some);
        if !all_data_present {
            self.reed_solomon()?
                .reconstruct_data(&mut slots)
                .map_err(|e| ErasureError::Reconstruction(format!("{:?}", e)))?;
        }

        let mut out = Vec::with_capacity(shard_size * k);
        for (index, slot) in slots.into_iter().take(k).enumerate() {
            let bytes = slot.ok_or_else(|| {
                ErasureError::Reconstruction(format!("data shard {} missing after rebuild", index))
            })?;
            out.extend_from_slice(&bytes);
        }
        out.truncate(original_len);
        Ok(out)
    }
}

/// Encode with the given parameters
pub fn encode(data: &[u8], params: ErasureParams) -> Result<Vec<Shard>, ErasureError> {
    ErasureCodec::new(params)?.encode(data)
}

/// Decode with the given parameters
pub fn decode(
    shards: &[Shard],
    params: ErasureParams,
    original_len: usize,
) -> Result<Vec<u8>, ErasureError> {
    ErasureCodec::new(params)?.decode(shards, original_len)
}
