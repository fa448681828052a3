/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged between observers, and between observers and generators.
//!
//! Round votes, acks, and block votes travel on the observer mesh. Block requests, generated blocks,
//! and observer signature sets travel on the generator link. Generated blocks are also relayed on the
//! observer mesh.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::codec::Packet,
    types::{
        block::Block,
        crypto_primitives::keccak256_concat,
        data_types::{Address, ChainID, Hash256, PublicKey, Signature},
    },
};

/// An observer's nomination of the generator for `target_height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundVoteMessage {
    pub chain_id: ChainID,
    pub last_hash: Hash256,
    pub target_height: u32,
    pub timeout_count: u32,
    pub generator: Address,
    pub public_key: PublicKey,
    pub timestamp: u64,
}

impl Packet for RoundVoteMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::RoundVoteMessage";
}

/// An observer's acknowledgement of the smallest round vote it saw. `nominated` is the observer that
/// cast that vote, and will request the block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundVoteAckMessage {
    pub chain_id: ChainID,
    pub last_hash: Hash256,
    pub target_height: u32,
    pub timeout_count: u32,
    pub generator: Address,
    pub nominated: PublicKey,
    pub public_key: PublicKey,
    pub timestamp: u64,
}

impl Packet for RoundVoteAckMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::RoundVoteAckMessage";
}

/// The nominated observer's request for a generator to produce its turn on top of `prev_hash`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockReqMessage {
    pub chain_id: ChainID,
    pub prev_hash: Hash256,
    pub target_height: u32,
    pub timeout_count: u32,
    pub generator: Address,
}

impl Packet for BlockReqMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::BlockReqMessage";
}

/// Withdraws `request`: the nominated observer stopped waiting for the turn it asked for.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockRevokeMessage {
    pub request: BlockReqMessage,
}

impl Packet for BlockRevokeMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::BlockRevokeMessage";
}

/// A generated block. Its only block signature is the generator's.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockGenMessage {
    pub block: Block,
}

impl BlockGenMessage {
    pub fn generator_signature(&self) -> Option<&Signature> {
        self.block.body.block_signatures.first()
    }
}

impl Packet for BlockGenMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::BlockGenMessage";
}

/// An observer's signature over a generated block it executed.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockVoteMessage {
    pub target_height: u32,
    pub header_hash: Hash256,
    pub observer_signature: Signature,
    pub public_key: PublicKey,
}

impl Packet for BlockVoteMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::BlockVoteMessage";
}

/// The observer signatures a block was committed with, sent to generators after the commit.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockObSignMessage {
    pub height: u32,
    pub header_hash: Hash256,
    pub observer_signatures: Vec<Signature>,
}

impl Packet for BlockObSignMessage {
    const TYPE_NAME: &'static str = "pof_rs::consensus::BlockObSignMessage";
}

/// What observers sign: the header hash followed by the generator's signature.
pub fn observer_sign_digest(header_hash: &Hash256, generator_signature: &Signature) -> Hash256 {
    keccak256_concat(&[header_hash.bytes(), generator_signature.bytes()])
}
