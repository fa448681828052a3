/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transactions, their hashes, and time-slot arithmetic.
//!
//! A transaction's timestamp places it in a one-second **time-slot**. Time-slots are what make
//! transactions replay-free: a `(slot, tx_hash)` pair can be consumed at most once in any context, and a
//! block only accepts transactions from its own slot or the one immediately before it.

use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{keccak256_concat, recover_address, Keypair, SignatureError},
    data_types::{Address, ChainID, Hash256, Signature},
};

pub const NANOS_PER_SLOT: u64 = 1_000_000_000;

/// A signed request to change the state of the chain.
///
/// `from` is not part of the signed bytes: it is the recovered signer, filled in during admission or
/// block execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub chain_id: ChainID,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    pub seq: u64,
    pub to: Address,
    pub method: String,
    pub args: Vec<u8>,
    pub gas: u64,
    pub use_seq: bool,
    pub is_ether_type: bool,
    #[borsh_skip]
    pub from: Address,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    Admin = 0,
    Contract = 1,
    Ether = 2,
}

impl Transaction {
    pub fn time_slot(&self) -> u64 {
        self.timestamp / NANOS_PER_SLOT
    }

    pub fn transaction_type(&self) -> TransactionType {
        if self.is_ether_type {
            TransactionType::Ether
        } else if self.to.is_zero() {
            TransactionType::Admin
        } else {
            TransactionType::Contract
        }
    }

    /// Whether this transaction is ordered by its account's sequence number.
    pub fn is_sequenced(&self) -> bool {
        self.use_seq || self.is_ether_type
    }

    /// `keccak(ChainID_le ‖ u16_be(type << 8) ‖ borsh(tx))`.
    ///
    /// The hash does not mix in the height of the block that includes the transaction, so the same
    /// transaction hashes the same in every block. Replays are refused by the time-slot instead: a block
    /// consumes `(slot, hash)` for each of its transactions, and a consumed pair is rejected until shrinking
    /// drops it, by which time the slot is outside every block's window.
    pub fn hash(&self) -> Hash256 {
        let type_tag = ((self.transaction_type() as u16) << 8).to_be_bytes();
        let bytes = self
            .try_to_vec()
            .expect("Programming error: failed to serialize a transaction");
        keccak256_concat(&[&self.chain_id.to_le_bytes(), &type_tag, &bytes])
    }

    pub fn sign(&self, keypair: &Keypair) -> Signature {
        keypair.sign(&self.hash())
    }

    pub fn recover_signer(&self, signature: &Signature) -> Result<Address, SignatureError> {
        recover_address(&self.hash(), signature)
    }

    pub fn is_valid_for(&self, chain_id: ChainID) -> bool {
        self.chain_id == chain_id && !self.method.is_empty()
    }
}

/// A transaction together with its signature, its hash, and (in `transaction.from`) its recovered signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub signature: Signature,
    pub hash: Hash256,
}

impl SignedTransaction {
    /// Hash `transaction`, recover its signer from `signature`, and record the signer in `from`.
    pub fn recover(mut transaction: Transaction, signature: Signature) -> Result<Self, SignatureError> {
        let hash = transaction.hash();
        transaction.from = recover_address(&hash, &signature)?;
        Ok(SignedTransaction {
            transaction,
            signature,
            hash,
        })
    }

    pub fn signer(&self) -> Address {
        self.transaction.from
    }

    pub fn time_slot(&self) -> u64 {
        self.transaction.time_slot()
    }
}

/// Position of a transaction in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct TxID {
    pub height: u32,
    pub index: u16,
}

impl TxID {
    /// Big-endian `height ‖ index`, suitable as an ordered store key.
    pub fn to_key(&self) -> [u8; 6] {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(&self.height.to_be_bytes());
        key[4..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

pub fn current_slot() -> u64 {
    unix_nanos() / NANOS_PER_SLOT
}

pub fn slot_of(timestamp: u64) -> u64 {
    timestamp / NANOS_PER_SLOT
}
