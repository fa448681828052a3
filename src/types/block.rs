/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of [`Block`], its [`Header`] and [`Body`], and the per-transaction [`Receipt`].

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::keccak256,
    data_types::{Address, Hash256, Signature},
    transaction::Transaction,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub version: u16,
    pub height: u32,
    pub prev_hash: Hash256,
    pub level_root_hash: Hash256,
    pub context_hash: Hash256,
    /// Nanoseconds since the Unix epoch. Strictly greater than the parent's.
    pub timestamp: u64,
    pub generator: Address,
    pub timeout_count: u32,
    /// Borsh-encoded [`ConsensusData`](crate::consensus::pof::ConsensusData).
    pub consensus_data: Vec<u8>,
    pub receipt_hash: Hash256,
}

impl Header {
    pub fn hash(&self) -> Hash256 {
        keccak256(
            &self
                .try_to_vec()
                .expect("Programming error: failed to serialize a header"),
        )
    }

    pub fn time_slot(&self) -> u64 {
        super::transaction::slot_of(self.timestamp)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Body {
    pub transactions: Vec<Transaction>,
    pub transaction_signatures: Vec<Signature>,
    pub events: Vec<ChainEvent>,
    /// `[generator signature, observer signature₁, …, observer signatureₖ]`.
    pub block_signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// An event emitted by the application while executing the transaction at `index`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainEvent {
    pub index: u16,
    pub name: String,
    pub data: Vec<u8>,
}

/// Outcome of executing one transaction. Non-ether transactions produce the empty receipt.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Receipt {
    pub gas_used: u64,
    pub logs: Vec<Vec<u8>>,
}

pub fn receipts_hash(receipts: &[Receipt]) -> Hash256 {
    keccak256(
        &receipts
            .to_vec()
            .try_to_vec()
            .expect("Programming error: failed to serialize receipts"),
    )
}
