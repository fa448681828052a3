/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::codec::Packet,
    types::{data_types::Signature, transaction::Transaction},
};

/// The most transactions a peer may put into one message.
pub const MAX_TRANSACTIONS_PER_MESSAGE: usize = 1000;

/// A batch of transactions gossiped between nodes and generators. `signatures[i]` signs
/// `transactions[i]`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionMessage {
    pub transactions: Vec<Transaction>,
    pub signatures: Vec<Signature>,
}

impl Packet for TransactionMessage {
    const TYPE_NAME: &'static str = "pof_rs::txpool::TransactionMessage";
}
