/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable chain persistence.
//!
//! pof_rs does not ship a database. Library users provide a [`KVStore`]: a key-value store with atomic
//! write batches. Chain variables are laid out in it as described in [`variables`](super::variables).

use std::fmt::Display;

use borsh::BorshDeserialize;

use crate::types::{
    block::{Header, Receipt},
    data_types::{to_hex, Hash256},
};

use super::{
    pile::PileError,
    variables::{self, at_height, concat},
};

pub trait KVStore: KVGet + Clone + Send + Sync + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn height(&self) -> Result<Option<u32>, StoreError> {
        get_value(self, &variables::HEIGHT, Key::Height)
    }

    fn block_hash(&self, height: u32) -> Result<Option<Hash256>, StoreError> {
        get_value(
            self,
            &at_height(&variables::BLOCK_HASH_AT, height),
            Key::BlockHash { height },
        )
    }

    fn header(&self, height: u32) -> Result<Option<Header>, StoreError> {
        get_value(
            self,
            &at_height(&variables::HEADER_AT, height),
            Key::Header { height },
        )
    }

    fn receipts(&self, height: u32) -> Result<Option<Vec<Receipt>>, StoreError> {
        get_value(
            self,
            &at_height(&variables::RECEIPTS_AT, height),
            Key::Receipts { height },
        )
    }

    fn genesis_hash(&self) -> Result<Option<Hash256>, StoreError> {
        get_value(self, &variables::GENESIS_HASH, Key::GenesisHash)
    }

    fn last_pruned_slot(&self) -> Result<Option<u64>, StoreError> {
        get_value(self, &variables::LAST_PRUNED_SLOT, Key::LastPrunedSlot)
    }

    /// Get a raw state value. `key` excludes the [`STATE`](variables::STATE) prefix.
    fn state(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get(&concat(&variables::STATE, key))
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub(crate) fn get_value<G: KVGet + ?Sized, T: BorshDeserialize>(
    kv: &G,
    key: &[u8],
    name: Key,
) -> Result<Option<T>, StoreError> {
    match kv.get(key) {
        None => Ok(None),
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|source| StoreError::DeserializeValueError { key: name, source }),
    }
}

/// Error when reading from or writing to the chain store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot append a block at height {found}, expected height {expected}")]
    InvalidAppendHeight { expected: u32, found: u32 },
    #[error("store was initialized with a different genesis hash")]
    GenesisMismatch,
    #[error("store has not been initialized with a genesis")]
    NotInitialized,
    #[error("store is closed")]
    StoreClosed,
    #[error("expected a value at {key}, found none")]
    ValueExpectedButNotFound { key: Key },
    #[error("failed to deserialize the value at {key}: {source}")]
    DeserializeValueError { key: Key, source: std::io::Error },
    #[error(transparent)]
    Pile(#[from] PileError),
}

#[derive(Debug)]
pub enum Key {
    Height,
    BlockHash { height: u32 },
    Header { height: u32 },
    Block { height: u32 },
    Receipts { height: u32 },
    GenesisHash,
    LastPrunedSlot,
    State { key: Vec<u8> },
    NodeRecord { address: String },
    NodePoolIndex,
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Height => write!(f, "Height"),
            Key::BlockHash { height } => write!(f, "Block Hash (height: {})", height),
            Key::Header { height } => write!(f, "Header (height: {})", height),
            Key::Block { height } => write!(f, "Block (height: {})", height),
            Key::Receipts { height } => write!(f, "Receipts (height: {})", height),
            Key::GenesisHash => write!(f, "Genesis Hash"),
            Key::LastPrunedSlot => write!(f, "Last Pruned Slot"),
            Key::State { key } => write!(f, "State (key: {})", to_hex(key)),
            Key::NodeRecord { address } => write!(f, "Node Record (address: {})", address),
            Key::NodePoolIndex => write!(f, "Node Pool Index"),
        }
    }
}
