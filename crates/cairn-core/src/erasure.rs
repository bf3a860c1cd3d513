//! Reed-Solomon erasure coding
//!
//! A group of `k` equal-length data shards is extended with `m` parity
//! shards; any `k` of the `k + m` shards rebuild the data. Shard indices
//! `0..k` are data, `k..k + m` are parity. Callers pad data with
//! [`pad_shards`] before encoding and truncate with [`join_shards`] after
//! decoding.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErasureError {
    #[error("Not enough shards to reconstruct (have {have}, need {need})")]
    InsufficientShards { have: usize, need: usize },
    #[error("Invalid coding parameters: {0}")]
    InvalidParameters(String),
    #[error("Invalid shard size")]
    InvalidShardSize,
    #[error("Shard index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("Codec failure: {0}")]
    Codec(String),
}

/// Erasure coding configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        // 4 data + 2 parity = 6 total shards
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }
}

impl ErasureConfig {
    /// Total number of shards (k + m)
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn validate(&self) -> Result<(), ErasureError> {
        if self.data_shards == 0 || self.parity_shards == 0 {
            return Err(ErasureError::InvalidParameters(
                "data and parity shard counts must be non-zero".to_string(),
            ));
        }
        if self.total_shards() > u16::MAX as usize {
            return Err(ErasureError::InvalidParameters(format!(
                "{} shards exceed the codec limit",
                self.total_shards()
            )));
        }
        Ok(())
    }
}

/// One unit of an erasure coded group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub data: Vec<u8>,
}

/// Shard length the codec accepts for a payload of `len` bytes: non-zero and even
pub fn shard_len_for(len: usize, data_shards: usize) -> usize {
    let mut shard_len = len.div_ceil(data_shards.max(1)).max(2);
    if shard_len % 2 != 0 {
        shard_len += 1;
    }
    shard_len
}

/// Pad and split data into `data_shards` equal shards
pub fn pad_shards(data: &[u8], data_shards: usize) -> Vec<Vec<u8>> {
    let shard_len = shard_len_for(data.len(), data_shards);
    let mut padded = data.to_vec();
    padded.resize(shard_len * data_shards, 0);
    padded.chunks(shard_len).map(|c| c.to_vec()).collect()
}

/// Concatenate data shards and truncate to the recorded original length
pub fn join_shards(shards: &[Vec<u8>], original_len: usize) -> Vec<u8> {
    let mut data = crate::chunk::join(shards);
    data.truncate(original_len);
    data
}

fn check_shard_lengths<'a>(shards: impl Iterator<Item = &'a [u8]>) -> Result<usize, ErasureError> {
    let mut len = None;
    for shard in shards {
        match len {
            None => len = Some(shard.len()),
            Some(l) if l != shard.len() => return Err(ErasureError::InvalidShardSize),
            _ => {}
        }
    }
    match len {
        Some(l) if l > 0 && l % 2 == 0 => Ok(l),
        _ => Err(ErasureError::InvalidShardSize),
    }
}

/// Extend `k` data shards with `config.parity_shards` parity shards.
///
/// Returns all `k + m` shards, data first.
pub fn encode(data: &[Vec<u8>], config: ErasureConfig) -> Result<Vec<Shard>, ErasureError> {
    config.validate()?;
    if data.len() != config.data_shards {
        return Err(ErasureError::InvalidParameters(format!(
            "expected {} data shards, got {}",
            config.data_shards,
            data.len()
        )));
    }
    let shard_len = check_shard_lengths(data.iter().map(|s| s.as_slice()))?;

    let mut encoder = ReedSolomonEncoder::new(config.data_shards, config.parity_shards, shard_len)
        .map_err(|e| ErasureError::Codec(e.to_string()))?;
    for shard in data {
        encoder
            .add_original_shard(shard)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;
    }
    let result = encoder
        .encode()
        .map_err(|e| ErasureError::Codec(e.to_string()))?;

    let mut shards: Vec<Shard> = data
        .iter()
        .enumerate()
        .map(|(index, d)| Shard {
            index,
            data: d.clone(),
        })
        .collect();
    shards.extend(result.recovery_iter().enumerate().map(|(i, parity)| Shard {
        index: config.data_shards + i,
        data: parity.to_vec(),
    }));
    Ok(shards)
}

/// Rebuild the `k` data shards from any `k` of the `k + m` shards
pub fn decode(shards: &[Shard], config: ErasureConfig) -> Result<Vec<Vec<u8>>, ErasureError> {
    config.validate()?;
    let k = config.data_shards;

    // Later duplicates of an index are ignored
    let mut unique: BTreeMap<usize, &[u8]> = BTreeMap::new();
    for shard in shards {
        if shard.index >= config.total_shards() {
            return Err(ErasureError::IndexOutOfRange(shard.index));
        }
        unique.entry(shard.index).or_insert(&shard.data);
    }
    if unique.len() < k {
        return Err(ErasureError::InsufficientShards {
            have: unique.len(),
            need: k,
        });
    }
    let shard_len = check_shard_lengths(unique.values().copied())?;

    let mut originals: Vec<Option<Vec<u8>>> = vec![None; k];
    for (&index, data) in unique.range(..k) {
        originals[index] = Some(data.to_vec());
    }
    if originals.iter().all(|o| o.is_some()) {
        return Ok(originals.into_iter().flatten().collect());
    }

    let mut decoder = ReedSolomonDecoder::new(k, config.parity_shards, shard_len)
        .map_err(|e| ErasureError::Codec(e.to_string()))?;
    for (&index, data) in &unique {
        if index < k {
            decoder.add_original_shard(index, data)
        } else {
            decoder.add_recovery_shard(index - k, data)
        }
        .map_err(|e| ErasureError::Codec(e.to_string()))?;
    }
    tracing::debug!(
        "Reconstructing {} missing shards from {} of {}",
        originals.iter().filter(|o| o.is_none()).count(),
        unique.len(),
        config.total_shards()
    );
    let result = decoder
        .decode()
        .map_err(|e| ErasureError::Codec(e.to_string()))?;
    for (index, data) in result.restored_original_iter() {
        originals[index] = Some(data.to_vec());
    }

    let have = originals.iter().filter(|o| o.is_some()).count();
    if have != k {
        return Err(ErasureError::InsufficientShards { have, need: k });
    }
    Ok(originals.into_iter().flatten().collect())
}
