//! Upload sealing and download opening
//!
//! Both directions are CPU-bound and synchronous; the node runs them on the
//! blocking pool.
//!
//! Upload: split, encrypt each chunk, chain the blocks, optionally add
//! parity blocks per coding window. Download: recover missing blocks from
//! parity, verify the chain, then decrypt and join. Nothing is decrypted
//! before the whole chain verifies.

use cairn_core::crypto::CryptoEngine;
use cairn_core::erasure::{self, ErasureConfig, Shard};
use cairn_core::{chain, chunk, Block, BlockId, Error, ErasureLayout, FileId, FileRecord, ParityGroup, Result};
use tracing::debug;

/// Everything an upload produces, ready to persist
#[derive(Debug, Clone)]
pub struct SealedFile {
    pub record: FileRecord,
    pub data_blocks: Vec<Block>,
    pub parity_blocks: Vec<Block>,
}

impl SealedFile {
    /// Data blocks first, then parity
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.data_blocks.iter().chain(self.parity_blocks.iter())
    }
}

pub fn seal(
    engine: &CryptoEngine,
    data: &[u8],
    name: &str,
    chunk_size: usize,
    erasure: Option<ErasureConfig>,
) -> Result<SealedFile> {
    let chunks = chunk::split(data, chunk_size)?;
    let mut blocks = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| Block::new(engine.encrypt(chunk)?, i as u32))
        .collect::<Result<Vec<_>>>()?;
    chain::build(&mut blocks);

    let (layout, parity_blocks) = match erasure {
        Some(config) => {
            let (layout, parity) = add_parity(&blocks, config)?;
            (Some(layout), parity)
        }
        None => (None, Vec::new()),
    };

    let record = FileRecord {
        id: FileId::random()?,
        name: name.to_string(),
        size: data.len() as u64,
        mime_type: chunk::detect_mime_type(name),
        block_ids: blocks.iter().map(|b| b.id).collect(),
        created_at: cairn_core::now_millis(),
        erasure: layout,
    };
    debug!(
        "Sealed {}: {} data blocks, {} parity blocks",
        name,
        blocks.len(),
        parity_blocks.len()
    );

    Ok(SealedFile {
        record,
        data_blocks: blocks,
        parity_blocks,
    })
}

/// Parity over each window of `data_shards` blocks. A block's persisted
/// bytes are its shard; short windows are filled with zero shards.
fn add_parity(blocks: &[Block], config: ErasureConfig) -> Result<(ErasureLayout, Vec<Block>)> {
    config.validate()?;
    let k = config.data_shards;
    let mut groups = Vec::new();
    let mut parity_blocks = Vec::new();

    for window in blocks.chunks(k) {
        let encoded = window
            .iter()
            .map(|b| b.to_bytes())
            .collect::<Result<Vec<_>>>()?;
        let block_lens: Vec<usize> = encoded.iter().map(|e| e.len()).collect();
        let longest = block_lens.iter().copied().max().unwrap_or(0);
        let shard_len = erasure::shard_len_for(longest, 1);

        let mut shards: Vec<Vec<u8>> = encoded
            .into_iter()
            .map(|mut e| {
                e.resize(shard_len, 0);
                e
            })
            .collect();
        shards.resize(k, vec![0u8; shard_len]);

        let coded = erasure::encode(&shards, config)?;
        let mut parity_ids = Vec::with_capacity(config.parity_shards);
        for shard in coded.into_iter().skip(k) {
            let block = Block::new(shard.data, shard.index as u32)?;
            parity_ids.push(block.id);
            parity_blocks.push(block);
        }

        groups.push(ParityGroup {
            data_block_ids: window.iter().map(|b| b.id).collect(),
            parity_block_ids: parity_ids,
            shard_len,
            block_lens,
        });
    }

    Ok((
        ErasureLayout {
            data_shards: config.data_shards,
            parity_shards: config.parity_shards,
            groups,
        },
        parity_blocks,
    ))
}

/// Rebuild the missing data blocks of one coding window.
///
/// `data` and `parity` are positional; `None` marks a block that could not
/// be obtained. Blocks whose bytes do not match the recorded layout are
/// not trusted as shards.
pub fn recover_group(
    layout: &ErasureLayout,
    group: &ParityGroup,
    data: &[Option<Block>],
    parity: &[Option<Block>],
) -> Result<Vec<Block>> {
    let config = ErasureConfig {
        data_shards: layout.data_shards,
        parity_shards: layout.parity_shards,
    };
    let k = config.data_shards;
    let window_start = layout
        .groups
        .iter()
        .position(|g| g.data_block_ids == group.data_block_ids)
        .ok_or_else(|| Error::InvalidData("coding window not in layout".to_string()))?
        * k;
    let mut shards = Vec::with_capacity(config.total_shards());

    for (index, block) in data.iter().enumerate() {
        let Some(block) = block else { continue };
        // A tampered block must not be decoded into its neighbours
        if !block.is_intact() {
            return Err(Error::ChainIntegrity {
                index: window_start + index,
                reason: chain::ChainBreak::HashMismatch,
            });
        }
        let mut bytes = block.to_bytes()?;
        if group.block_lens.get(index) != Some(&bytes.len()) {
            continue;
        }
        bytes.resize(group.shard_len, 0);
        shards.push(Shard { index, data: bytes });
    }
    // Zero shards filling a short window are known
    for index in group.data_block_ids.len()..k {
        shards.push(Shard {
            index,
            data: vec![0u8; group.shard_len],
        });
    }
    for (i, block) in parity.iter().enumerate() {
        let Some(block) = block else { continue };
        if block.payload.len() != group.shard_len || !block.is_intact() {
            continue;
        }
        shards.push(Shard {
            index: k + i,
            data: block.payload.clone(),
        });
    }

    let decoded = erasure::decode(&shards, config)?;

    let mut recovered = Vec::with_capacity(group.data_block_ids.len());
    for (index, expected_id) in group.data_block_ids.iter().enumerate() {
        if let Some(Some(block)) = data.get(index) {
            recovered.push(block.clone());
            continue;
        }
        let len = group.block_lens.get(index).copied().unwrap_or(0);
        let bytes = decoded
            .get(index)
            .map(|shard| &shard[..len.min(shard.len())])
            .ok_or_else(|| Error::InvalidData("decoder returned too few shards".to_string()))?;
        let block = Block::from_bytes(bytes)?;
        if block.id != *expected_id {
            return Err(Error::InvalidData(format!(
                "recovered block {} where {} was expected",
                block.id, expected_id
            )));
        }
        recovered.push(block);
    }
    debug!("Recovered coding window of {} blocks", recovered.len());
    Ok(recovered)
}

/// Verify the chain, then decrypt and reassemble
pub fn open(engine: &CryptoEngine, record: &FileRecord, blocks: &[Block]) -> Result<Vec<u8>> {
    if blocks.len() != record.block_ids.len() {
        return Err(Error::InvalidData(format!(
            "expected {} blocks, got {}",
            record.block_ids.len(),
            blocks.len()
        )));
    }
    for (index, (block, expected)) in blocks.iter().zip(&record.block_ids).enumerate() {
        if block.id != *expected {
            return Err(Error::ChainIntegrity {
                index,
                reason: chain::ChainBreak::SequenceMismatch,
            });
        }
    }
    chain::verify(blocks).map_err(|(index, reason)| Error::ChainIntegrity { index, reason })?;

    let chunks = blocks
        .iter()
        .map(|b| engine.decrypt(&b.payload))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let data = chunk::join(&chunks);
    if data.len() as u64 != record.size {
        return Err(Error::InvalidData(format!(
            "reassembled {} bytes, record says {}",
            data.len(),
            record.size
        )));
    }
    Ok(data)
}

/// Which data blocks each window is missing
pub fn missing_by_group<'a>(
    layout: &'a ErasureLayout,
    present: impl Fn(&BlockId) -> bool,
) -> Vec<&'a ParityGroup> {
    layout
        .groups
        .iter()
        .filter(|g| g.data_block_ids.iter().any(|id| !present(id)))
        .collect()
}
