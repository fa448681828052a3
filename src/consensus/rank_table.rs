/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The rank table that orders generators.
//!
//! Each generator has a [`Rank`] whose score is `(phase << 32) | u32_be(hash_space[..4])`. The table is
//! kept sorted ascending by `(score, address)`, and the generator at index `k` is the one nominated after
//! `k` timeouts.
//!
//! After every block:
//! 1. If it was produced after `k > 0` timeouts, the first `k` ranks get `phase += 2`.
//! 2. Its generator gets `phase += 1`, and its hash space becomes the block's [`append_hash`].
//! 3. The table is re-sorted.
//!
//! The table lives in the chain state under [`RANK_TABLE`](crate::store::variables::RANK_TABLE), so it is
//! covered by every block's context hash.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    context::{errors::ChainError, Context},
    store::{chain_store::ChainStore, pluggables::{KVStore, StoreError}, variables},
    types::{
        crypto_primitives::{double_keccak256, keccak256},
        data_types::{Address, Hash256},
    },
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Rank {
    pub address: Address,
    pub phase: u32,
    pub hash_space: Hash256,
}

impl Rank {
    pub fn new(address: Address, phase: u32, hash_space: Hash256) -> Rank {
        Rank {
            address,
            phase,
            hash_space,
        }
    }

    pub fn score(&self) -> u64 {
        let prefix = self.hash_space.bytes();
        ((self.phase as u64) << 32)
            | u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64
    }

    fn key(&self) -> (u64, Address) {
        (self.score(), self.address)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RankTable {
    ranks: Vec<Rank>,
}

impl RankTable {
    /// A table for the genesis state. Every generator starts at phase 0 with the keccak of its address
    /// as its hash space. Duplicates are ignored.
    pub fn new(generators: impl IntoIterator<Item = Address>) -> RankTable {
        let mut table = RankTable { ranks: Vec::new() };
        for address in generators {
            if !table.contains(&address) {
                table
                    .ranks
                    .push(Rank::new(address, 0, keccak256(address.bytes())));
            }
        }
        table.sort();
        table
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.ranks.iter().map(|rank| rank.address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.position(address).is_some()
    }

    pub fn position(&self, address: &Address) -> Option<usize> {
        self.ranks.iter().position(|rank| rank.address == *address)
    }

    /// The generator nominated after `timeout_count` timeouts, wrapping around the table.
    pub fn top(&self, timeout_count: u32) -> Option<Address> {
        if self.ranks.is_empty() {
            return None;
        }
        Some(self.ranks[timeout_count as usize % self.ranks.len()].address)
    }

    /// Push the first `timeout_count` ranks back by two phases each.
    pub fn apply_timeout(&mut self, timeout_count: u32) {
        let skipped = (timeout_count as usize).min(self.ranks.len());
        for rank in &mut self.ranks[..skipped] {
            rank.phase += 2;
        }
        self.sort();
    }

    /// Advance `generator` past a block it produced.
    pub fn forward(&mut self, generator: &Address, append_hash: Hash256) -> Result<(), ChainError> {
        let position = self.position(generator).ok_or(ChainError::InvalidGenerator)?;
        let rank = &mut self.ranks[position];
        rank.phase += 1;
        rank.hash_space = append_hash;
        self.sort();
        Ok(())
    }

    fn sort(&mut self) {
        self.ranks.sort_by_key(Rank::key);
    }

    pub fn load(ctx: &Context) -> Result<RankTable, ChainError> {
        Ok(ctx.get_value(&variables::RANK_TABLE)?.unwrap_or_default())
    }

    pub fn save(&self, ctx: &mut Context) {
        ctx.set_value(variables::RANK_TABLE.to_vec(), self)
    }

    /// The table as of the store's tip.
    pub fn from_store<K: KVStore>(store: &ChainStore<K>) -> Result<RankTable, StoreError> {
        Ok(store.state_value(&variables::RANK_TABLE)?.unwrap_or_default())
    }
}

/// The hash a block leaves in its generator's rank: `doubleKeccak(prev_hash ‖ level_root_hash ‖ generator)`.
pub fn append_hash(prev_hash: &Hash256, level_root_hash: &Hash256, generator: &Address) -> Hash256 {
    let mut bytes = Vec::with_capacity(32 + 32 + 20);
    bytes.extend_from_slice(prev_hash.bytes());
    bytes.extend_from_slice(level_root_hash.bytes());
    bytes.extend_from_slice(generator.bytes());
    double_keccak256(&bytes)
}
