/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by observers, generators, and nodes, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Library users can register
//! handlers for events through the `on_*` setters of the role specs (e.g.,
//! [`ObserverSpec`](crate::replica::ObserverSpec)); handlers run on a separate
//! [event bus](crate::event_bus) thread.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::types::data_types::{Address, Hash256, PublicKey};

pub enum Event {
    // Events that change persistent state.
    CommitBlock(CommitBlockEvent),
    // Events on the block pipeline.
    ProduceBlock(ProduceBlockEvent),
    ReceiveBlockGen(ReceiveBlockGenEvent),
    DeadLetter(DeadLetterEvent),
    ExpireTransactions(ExpireTransactionsEvent),
    // Vote round events.
    RoundVote(RoundVoteEvent),
    RoundVoteAck(RoundVoteAckEvent),
    BlockVote(BlockVoteEvent),
    GeneratorTimeout(GeneratorTimeoutEvent),
    // Catch-up events.
    RequestBlocks(RequestBlocksEvent),
    ServeBlocks(ServeBlocksEvent),
    // Peer events.
    ForkDetected(ForkDetectedEvent),
    RemovePeer(RemovePeerEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus stops before the roles during shutdown.
            let _ = event_publisher.send(event);
        }
    }
}

/// A block was appended to the local chain store.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub height: u32,
    pub block: Hash256,
    pub transactions: usize,
}

/// A generator produced and signed a block.
pub struct ProduceBlockEvent {
    pub timestamp: SystemTime,
    pub height: u32,
    pub block: Hash256,
    pub transactions: usize,
    pub turn_index: u32,
}

/// An observer received a generated block and executed it successfully.
pub struct ReceiveBlockGenEvent {
    pub timestamp: SystemTime,
    pub origin: PublicKey,
    pub height: u32,
    pub block: Hash256,
}

/// Transactions popped from the pool that failed to execute during block construction.
pub struct DeadLetterEvent {
    pub timestamp: SystemTime,
    pub height: u32,
    pub transactions: Vec<(Hash256, String)>,
}

/// Transactions dropped from the pool because their time-slot passed.
pub struct ExpireTransactionsEvent {
    pub timestamp: SystemTime,
    pub transactions: Vec<Hash256>,
}

pub struct RoundVoteEvent {
    pub timestamp: SystemTime,
    pub target_height: u32,
    pub timeout_count: u32,
    pub generator: Address,
}

pub struct RoundVoteAckEvent {
    pub timestamp: SystemTime,
    pub target_height: u32,
    pub timeout_count: u32,
    pub nominated: PublicKey,
}

pub struct BlockVoteEvent {
    pub timestamp: SystemTime,
    pub height: u32,
    pub block: Hash256,
}

/// Observers stopped waiting for a generator and will ignore it for a while.
pub struct GeneratorTimeoutEvent {
    pub timestamp: SystemTime,
    pub target_height: u32,
    pub generator: Address,
    pub disconnected: bool,
}

pub struct RequestBlocksEvent {
    pub timestamp: SystemTime,
    pub peer: PublicKey,
    pub height: u32,
    pub count: u32,
}

pub struct ServeBlocksEvent {
    pub timestamp: SystemTime,
    pub peer: PublicKey,
    pub height: u32,
    pub count: u32,
    pub from_batch_cache: bool,
}

/// A peer's chain diverges from the local one. The role halts block appends afterwards.
pub struct ForkDetectedEvent {
    pub timestamp: SystemTime,
    pub peer: PublicKey,
    pub height: u32,
    pub local: Hash256,
    pub remote: Hash256,
}

pub struct RemovePeerEvent {
    pub timestamp: SystemTime,
    pub peer: PublicKey,
    pub reason: String,
}
