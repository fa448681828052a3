/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The level root: a 16-ary, four-level keccak aggregation over `[prev_hash, tx_hash₁, …, tx_hashₙ]`.
//!
//! Each level groups its inputs by 16, padding the last group with [`Hash256::zero`]. A group hashes to
//! `double_keccak(h₀ ‖ s₀ ‖ h₁ ‖ s₁ ‖ … ‖ s₁₄ ‖ h₁₅)`, where `s` is the domain separator
//! [`LEVEL_SEPARATOR`] interleaved one byte per slot. Four levels reduce up to 65 536 inputs to one root.

use super::{crypto_primitives::double_keccak256, data_types::Hash256};

pub const LEVEL_SEPARATOR: &[u8; 15] = b"fletablockchain";
pub const GROUP_SIZE: usize = 16;
pub const LEVELS: usize = 4;
pub const MAX_LEVEL_INPUTS: usize = 65_536;

pub fn build_level_root(hashes: &[Hash256]) -> Result<Hash256, LevelRootError> {
    if hashes.is_empty() {
        return Err(LevelRootError::Empty);
    }
    if hashes.len() > MAX_LEVEL_INPUTS {
        return Err(LevelRootError::TooManyHashes(hashes.len()));
    }

    let mut level = hashes.to_vec();
    for _ in 0..LEVELS {
        level = level.chunks(GROUP_SIZE).map(hash_group).collect();
    }
    Ok(level[0])
}

fn hash_group(group: &[Hash256]) -> Hash256 {
    let mut buf = Vec::with_capacity(GROUP_SIZE * 32 + LEVEL_SEPARATOR.len());
    for i in 0..GROUP_SIZE {
        let hash = group.get(i).copied().unwrap_or_else(Hash256::zero);
        buf.extend_from_slice(hash.bytes());
        if let Some(separator) = LEVEL_SEPARATOR.get(i) {
            buf.push(*separator);
        }
    }
    double_keccak256(&buf)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LevelRootError {
    #[error("level root needs at least one hash")]
    Empty,
    #[error("level root takes at most 65536 hashes, got {0}")]
    TooManyHashes(usize),
}
