/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::{
    store::pluggables::StoreError,
    types::{
        crypto_primitives::SignatureError,
        data_types::{Address, Hash256},
        level_root::LevelRootError,
    },
};

use super::application::AppError;

/// Error when validating, executing, or connecting a block.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block version {found} is newer than supported version {max}")]
    InvalidVersion { max: u16, found: u16 },
    #[error("block height {found} does not follow height {expected}")]
    InvalidHeight { expected: u32, found: u32 },
    #[error("block does not link to the previous block {expected}")]
    InvalidPrevHash { expected: Hash256 },
    #[error("block timestamp {found} is not after {previous}")]
    InvalidTimestamp { previous: u64, found: u64 },
    #[error("context hash mismatch")]
    InvalidContextHash,
    #[error("level root hash mismatch")]
    InvalidLevelRootHash,
    #[error("receipt hash mismatch")]
    InvalidReceiptHash,
    #[error("block was not produced by the generator whose turn it is")]
    InvalidGenerator,
    #[error("invalid consensus data")]
    InvalidConsensusData,
    #[error("transaction belongs to another chain")]
    InvalidChainID,
    #[error("time-slot {slot} is outside the window of block slot {block_slot}")]
    InvalidTransactionTimeSlot { slot: u64, block_slot: u64 },
    #[error("time-slot already used by this transaction")]
    UsedTimeSlot,
    #[error("expected sequence {expected}, found {found}")]
    InvalidSequence { expected: u64, found: u64 },
    #[error("{0} is not an admin")]
    NotAdmin(Address),
    #[error("context left {0} snapshots open after execution")]
    DirtyContext(usize),
    #[error("parent block at height {0} was not connected in time")]
    ConnectedBlockTimeout(u32),
    #[error("chain is closed")]
    ChainClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    LevelRoot(#[from] LevelRootError),
    #[error("application rejected the transaction: {0}")]
    App(#[from] AppError),
}

impl ChainError {
    /// Whether this error means local state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::DirtyContext(_))
    }
}
