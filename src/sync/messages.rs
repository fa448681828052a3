/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages exchanged by the catch-up protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::codec::Packet,
    types::{block::Block, data_types::Hash256},
};

/// The most blocks one [`RequestMessage`] may ask for.
pub const MAX_BLOCKS_PER_REQUEST: u32 = 10;

/// A peer's committed tip.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StatusMessage {
    pub height: u32,
    pub last_hash: Hash256,
}

impl Packet for StatusMessage {
    const TYPE_NAME: &'static str = "pof_rs::sync::StatusMessage";
}

/// Ask for the committed blocks `height .. height + count`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestMessage {
    pub height: u32,
    pub count: u32,
}

impl Packet for RequestMessage {
    const TYPE_NAME: &'static str = "pof_rs::sync::RequestMessage";
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockMessage {
    pub blocks: Vec<Block>,
}

impl Packet for BlockMessage {
    const TYPE_NAME: &'static str = "pof_rs::sync::BlockMessage";
}
