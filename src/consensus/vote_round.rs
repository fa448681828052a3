/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-height state an observer keeps while agreeing on a block.
//!
//! A [`VoteRound`] is opened for `target_height = chain height + 1` and replaced wholesale when the
//! round commits its generator's last block, times out, or falls behind the chain. It preallocates one
//! [`BlockRound`] for every height the nominated generator may produce in its turn.

use std::{collections::BTreeMap, time::Instant};

use crate::{
    context::Context,
    types::{
        block::Receipt,
        data_types::{Address, Hash256, PublicKey},
    },
};

use super::messages::{BlockGenMessage, BlockVoteMessage, RoundVoteAckMessage, RoundVoteMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoundState {
    RoundVote,
    RoundVoteAck,
    BlockWait,
    BlockVote,
}

/// The block at one height of a generator's turn.
#[derive(Default)]
pub struct BlockRound {
    /// The generated block, once it executed successfully.
    pub block_gen: Option<BlockGenMessage>,
    pub executed: Option<(Context, Vec<Receipt>)>,
    pub votes: BTreeMap<PublicKey, BlockVoteMessage>,
    /// A block that arrived before the round reached this height.
    pub block_gen_wait: Option<(PublicKey, BlockGenMessage)>,
    /// Votes that arrived before this height's block was executed.
    pub vote_wait: BTreeMap<PublicKey, BlockVoteMessage>,
    pub last_request: Option<Instant>,
    /// Whether this observer already relayed the block to its peers.
    pub relayed: bool,
}

impl BlockRound {
    pub fn header_hash(&self) -> Option<Hash256> {
        self.block_gen.as_ref().map(|message| message.block.hash())
    }
}

pub struct VoteRound {
    pub state: RoundState,
    pub target_height: u32,
    pub last_hash: Hash256,
    pub round_votes: BTreeMap<PublicKey, RoundVoteMessage>,
    pub acks: BTreeMap<PublicKey, RoundVoteAckMessage>,
    /// Acks that arrived while still collecting round votes.
    pub ack_wait: BTreeMap<PublicKey, RoundVoteAckMessage>,
    pub min_ack: Option<RoundVoteAckMessage>,
    pub block_rounds: BTreeMap<u32, BlockRound>,
    /// The height within the turn that is being waited on or voted on.
    pub current_height: u32,
    pub vote_fail_count: u32,
}

impl VoteRound {
    pub fn new(target_height: u32, last_hash: Hash256, max_blocks_per_generator: u32) -> VoteRound {
        let block_rounds = (target_height..target_height + max_blocks_per_generator.max(1))
            .map(|height| (height, BlockRound::default()))
            .collect();
        VoteRound {
            state: RoundState::RoundVote,
            target_height,
            last_hash,
            round_votes: BTreeMap::new(),
            acks: BTreeMap::new(),
            ack_wait: BTreeMap::new(),
            min_ack: None,
            block_rounds,
            current_height: target_height,
            vote_fail_count: 0,
        }
    }

    pub fn is_in_turn(&self, height: u32) -> bool {
        self.block_rounds.contains_key(&height)
    }

    pub fn block_round(&self, height: u32) -> Option<&BlockRound> {
        self.block_rounds.get(&height)
    }

    pub fn block_round_mut(&mut self, height: u32) -> Option<&mut BlockRound> {
        self.block_rounds.get_mut(&height)
    }

    /// The round vote with the smallest `(timeout_count, public_key)`, skipping votes for generators
    /// `is_ignored` rejects.
    pub fn min_round_vote(&self, is_ignored: impl Fn(&Address) -> bool) -> Option<&RoundVoteMessage> {
        self.round_votes
            .values()
            .filter(|vote| !is_ignored(&vote.generator))
            .min_by_key(|vote| (vote.timeout_count, vote.public_key))
    }

    /// An ack that at least `majority` of the received acks agree with, once `majority` acks arrived.
    pub fn agreed_ack(&self, majority: usize) -> Option<&RoundVoteAckMessage> {
        if self.acks.len() < majority {
            return None;
        }
        let mut tally: BTreeMap<(u32, PublicKey, Address), (usize, &RoundVoteAckMessage)> = BTreeMap::new();
        for ack in self.acks.values() {
            let entry = tally
                .entry((ack.timeout_count, ack.nominated, ack.generator))
                .or_insert((0, ack));
            entry.0 += 1;
        }
        tally
            .into_values()
            .find(|(count, _)| *count >= majority)
            .map(|(_, ack)| ack)
    }

    /// The generator whose turn this round is, once the nomination is agreed.
    pub fn generator(&self) -> Option<Address> {
        self.min_ack.as_ref().map(|ack| ack.generator)
    }

    /// The observer that requests blocks from the generator, once the nomination is agreed.
    pub fn nominated(&self) -> Option<PublicKey> {
        self.min_ack.as_ref().map(|ack| ack.nominated)
    }

    pub fn last_height(&self) -> u32 {
        self.block_rounds
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.target_height)
    }
}
