/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Proof-of-Formulator rules the committer enforces on every block.
//!
//! [`PofConsensus`] checks that a block was produced by the generator whose turn it is, advances the
//! [`RankTable`] stored in the block's context, and validates the generator and observer signatures a
//! block is committed with.

use std::collections::{BTreeSet, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    context::{errors::ChainError, hook::ConsensusHook, Context},
    types::{
        block::{Block, Header},
        crypto_primitives::{recover_address, recover_public_key, SignatureError},
        data_types::PublicKey,
    },
};

use super::{
    messages::observer_sign_digest,
    rank_table::{append_hash, RankTable},
};

/// What a header carries in its `consensus_data` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ConsensusData {
    /// The position of the block within its generator's turn.
    pub turn_index: u32,
}

impl ConsensusData {
    pub fn new(turn_index: u32) -> ConsensusData {
        ConsensusData { turn_index }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec()
            .expect("Programming error: failed to serialize consensus data")
    }

    /// `None` for the genesis header, whose consensus data is empty, and for malformed data.
    pub fn decode(bytes: &[u8]) -> Option<ConsensusData> {
        ConsensusData::try_from_slice(bytes).ok()
    }
}

pub struct PofConsensus {
    observers: BTreeSet<PublicKey>,
    max_blocks_per_generator: u32,
}

impl PofConsensus {
    pub fn new(
        observers: impl IntoIterator<Item = PublicKey>,
        max_blocks_per_generator: u32,
    ) -> PofConsensus {
        PofConsensus {
            observers: observers.into_iter().collect(),
            max_blocks_per_generator,
        }
    }

    pub fn observers(&self) -> &BTreeSet<PublicKey> {
        &self.observers
    }

    /// `⌊n/2⌋ + 1`: the number of observer signatures a block is committed with, and the number of acks
    /// that must agree on a nomination.
    pub fn majority(&self) -> usize {
        majority(self.observers.len())
    }

    fn check_turn(&self, ctx: &Context, header: &Header, table: &RankTable) -> Result<(), ChainError> {
        let data = ConsensusData::decode(&header.consensus_data).ok_or(ChainError::InvalidConsensusData)?;
        if data.turn_index == 0 {
            return match table.top(header.timeout_count) {
                Some(top) if top == header.generator => Ok(()),
                _ => Err(ChainError::InvalidGenerator),
            };
        }

        let prev_header = ctx.prev_header();
        let prev = ConsensusData::decode(&prev_header.consensus_data).ok_or(ChainError::InvalidGenerator)?;
        if header.timeout_count != 0
            || header.generator != prev_header.generator
            || data.turn_index != prev.turn_index + 1
            || data.turn_index >= self.max_blocks_per_generator
        {
            return Err(ChainError::InvalidGenerator);
        }
        Ok(())
    }
}

impl ConsensusHook for PofConsensus {
    fn apply_block(&self, ctx: &mut Context, header: &Header) -> Result<(), ChainError> {
        let mut table = RankTable::load(ctx)?;
        self.check_turn(ctx, header, &table)?;

        if header.timeout_count > 0 {
            table.apply_timeout(header.timeout_count);
        }
        table.forward(
            &header.generator,
            append_hash(&header.prev_hash, &header.level_root_hash, &header.generator),
        )?;
        table.save(ctx);
        Ok(())
    }

    fn validate_signatures(&self, block: &Block) -> Result<(), ChainError> {
        let header = &block.header;
        if header.height == 0 {
            return Ok(());
        }
        let signatures = &block.body.block_signatures;
        let generator_signature = signatures
            .first()
            .ok_or(SignatureError::InsufficientSignature)?;
        let header_hash = header.hash();
        if recover_address(&header_hash, generator_signature)? != header.generator {
            return Err(ChainError::InvalidGenerator);
        }

        let observer_signatures = &signatures[1..];
        if observer_signatures.len() != self.majority() {
            return Err(SignatureError::InsufficientSignature.into());
        }
        let digest = observer_sign_digest(&header_hash, generator_signature);
        let mut signers = HashSet::with_capacity(observer_signatures.len());
        for signature in observer_signatures {
            let signer = recover_public_key(&digest, signature)?;
            if !self.observers.contains(&signer) {
                return Err(SignatureError::InvalidPublicKey.into());
            }
            if !signers.insert(signer) {
                return Err(SignatureError::DuplicatedSignature.into());
            }
        }
        Ok(())
    }
}

/// `⌊n/2⌋ + 1`.
pub fn majority(observer_count: usize) -> usize {
    observer_count / 2 + 1
}

/// `⌊n/2⌋ + 2` round votes move an observer on to acking, clamped to `n` for small observer sets.
pub fn round_vote_quorum(observer_count: usize) -> usize {
    (observer_count / 2 + 2).min(observer_count)
}
