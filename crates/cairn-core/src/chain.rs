//! Hash chain over a file's block sequence
//!
//! Each block records the hash of its predecessor, so any change to a
//! payload, a hash or the ordering is detected by walking the chain. The
//! chain is scoped to one file.

use crate::types::Block;
use std::fmt;

/// Why a chain failed verification at a given index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBreak {
    /// `sequence_index` does not match the block's position
    SequenceMismatch,
    /// `hash` does not cover the payload
    HashMismatch,
    /// `previous_hash` does not equal the predecessor's hash
    LinkMismatch,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ChainBreak::SequenceMismatch => "sequence index out of place",
            ChainBreak::HashMismatch => "hash does not match payload",
            ChainBreak::LinkMismatch => "previous hash does not match predecessor",
        };
        f.write_str(reason)
    }
}

/// Link blocks in order: position becomes `sequence_index` and each
/// `previous_hash` is set to the predecessor's `hash`.
pub fn build(blocks: &mut [Block]) {
    let mut previous = None;
    for (index, block) in blocks.iter_mut().enumerate() {
        block.sequence_index = index as u32;
        block.previous_hash = previous;
        previous = Some(block.hash);
    }
}

/// Walk the sequence and return the first broken index
pub fn verify(blocks: &[Block]) -> Result<(), (usize, ChainBreak)> {
    let mut previous = None;
    for (index, block) in blocks.iter().enumerate() {
        if block.sequence_index as usize != index {
            return Err((index, ChainBreak::SequenceMismatch));
        }
        if !block.is_intact() {
            return Err((index, ChainBreak::HashMismatch));
        }
        if block.previous_hash != previous {
            return Err((index, ChainBreak::LinkMismatch));
        }
        previous = Some(block.hash);
    }
    Ok(())
}
