/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each chain variable is stored in the user-provided key-value store.
//!
//! # Chain variables
//!
//! |Variable|Key|Type|
//! |---|---|---|
//! |Height|[`HEIGHT`]|`u32`|
//! |Block hash at height|[`BLOCK_HASH_AT`] ‖ `height_be`|[`Hash256`](crate::types::data_types::Hash256)|
//! |Header at height|[`HEADER_AT`] ‖ `height_be`|[`Header`](crate::types::block::Header)|
//! |Receipts at height|[`RECEIPTS_AT`] ‖ `height_be`|`Vec<Receipt>`|
//! |Genesis hash|[`GENESIS_HASH`]|[`Hash256`](crate::types::data_types::Hash256)|
//! |Last pruned time-slot|[`LAST_PRUNED_SLOT`]|`u64`|
//! |Known peers|[`NODE_POOL`] ‖ `address`, [`NODE_POOL_INDEX`]|`NodeRecord`, `Vec<String>`|
//!
//! Block bodies are not stored here: they live in the [pile](super::pile).
//!
//! # State
//!
//! Everything a [`Context`](crate::context::Context) reads and writes lives under the [`STATE`] prefix.
//! The second byte of a state key selects its namespace:
//!
//! |Namespace|Key (after `STATE`)|Value|
//! |---|---|---|
//! |Accounts|[`ACCOUNTS`]|sorted `Vec<Address>`|
//! |Account data|[`ACCOUNT_DATA`] ‖ `address` ‖ `key`|bytes|
//! |Contract data|[`CONTRACT_DATA`] ‖ `address` ‖ `key`|bytes|
//! |Sequence|[`SEQ`] ‖ `address`|`u64`|
//! |Used time-slot|[`TIME_SLOT`] ‖ `slot_be` ‖ `tx_hash`|`[1]`|
//! |Time-slot count|[`TIME_SLOT_INDEX`] ‖ `slot_be`|`u32`|
//! |Time-slot entry|[`TIME_SLOT_INDEX`] ‖ `slot_be` ‖ `n_be`|`Hash256`|
//!
//! Every consumed time-slot appends one entry under its slot, so that shrinking can find the used
//! time-slot records of a slot without scanning keys.
//! |Rank table|[`RANK_TABLE`]|`RankTable`|
//! |Admins|[`ADMINS`]|`Vec<Address>`|

use crate::types::data_types::{Address, Hash256};

// Chain variables
pub const HEIGHT: [u8; 1] = [0x01];
pub const BLOCK_HASH_AT: [u8; 1] = [0x02];
pub const HEADER_AT: [u8; 1] = [0x03];
pub const RECEIPTS_AT: [u8; 1] = [0x04];
pub const GENESIS_HASH: [u8; 1] = [0x05];
pub const LAST_PRUNED_SLOT: [u8; 1] = [0x06];
pub const NODE_POOL: [u8; 1] = [0x07];
pub const NODE_POOL_INDEX: [u8; 1] = [0x08];
pub const STATE: [u8; 1] = [0x10];

// State namespaces
pub const ACCOUNTS: [u8; 1] = [0x20];
pub const ACCOUNT_DATA: [u8; 1] = [0x21];
pub const CONTRACT_DATA: [u8; 1] = [0x22];
pub const SEQ: [u8; 1] = [0x23];
pub const TIME_SLOT: [u8; 1] = [0x24];
pub const TIME_SLOT_INDEX: [u8; 1] = [0x25];
pub const RANK_TABLE: [u8; 1] = [0x26];
pub const ADMINS: [u8; 1] = [0x27];

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

pub fn at_height(prefix: &[u8; 1], height: u32) -> Vec<u8> {
    concat(prefix, &height.to_be_bytes())
}

pub fn account_data_key(address: &Address, key: &[u8]) -> Vec<u8> {
    concat(&concat(&ACCOUNT_DATA, address.bytes()), key)
}

pub fn contract_data_key(address: &Address, key: &[u8]) -> Vec<u8> {
    concat(&concat(&CONTRACT_DATA, address.bytes()), key)
}

pub fn seq_key(address: &Address) -> Vec<u8> {
    concat(&SEQ, address.bytes())
}

pub fn time_slot_key(slot: u64, tx_hash: &Hash256) -> Vec<u8> {
    concat(&concat(&TIME_SLOT, &slot.to_be_bytes()), tx_hash.bytes())
}

pub fn time_slot_count_key(slot: u64) -> Vec<u8> {
    concat(&TIME_SLOT_INDEX, &slot.to_be_bytes())
}

pub fn time_slot_entry_key(slot: u64, n: u32) -> Vec<u8> {
    concat(&time_slot_count_key(slot), &n.to_be_bytes())
}
