/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them through the `log_events` flag of
//! a role's configuration (e.g., [`ObserverConfiguration`](crate::replica::ObserverConfiguration)).
//!
//! pof_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed onto
//! a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is
//! how a [ReceiveBlockGen](crate::events::ReceiveBlockGenEvent) is printed:
//!
//! ```text
//! ReceiveBlockGen, 1701329264, Aid5u7f, fNGCJyk, 12
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the public key of the
//!   observer or generator that sent the block.
//! - The fourth value is the first seven characters of the Base64 encoding of the block's hash.
//! - The fifth value is the height of the block.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";

pub const PRODUCE_BLOCK: &str = "ProduceBlock";
pub const RECEIVE_BLOCK_GEN: &str = "ReceiveBlockGen";
pub const DEAD_LETTER: &str = "DeadLetter";
pub const EXPIRE_TRANSACTIONS: &str = "ExpireTransactions";

pub const ROUND_VOTE: &str = "RoundVote";
pub const ROUND_VOTE_ACK: &str = "RoundVoteAck";
pub const BLOCK_VOTE: &str = "BlockVote";
pub const GENERATOR_TIMEOUT: &str = "GeneratorTimeout";

pub const REQUEST_BLOCKS: &str = "RequestBlocks";
pub const SERVE_BLOCKS: &str = "ServeBlocks";

pub const FORK_DETECTED: &str = "ForkDetected";
pub const REMOVE_PEER: &str = "RemovePeer";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_block_event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(commit_block_event.timestamp),
                first_seven_base64_chars(commit_block_event.block.bytes()),
                commit_block_event.height,
                commit_block_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProduceBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |produce_block_event: &ProduceBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PRODUCE_BLOCK,
                secs_since_unix_epoch(produce_block_event.timestamp),
                first_seven_base64_chars(produce_block_event.block.bytes()),
                produce_block_event.height,
                produce_block_event.transactions,
                produce_block_event.turn_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveBlockGenEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_block_gen_event: &ReceiveBlockGenEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_BLOCK_GEN,
                secs_since_unix_epoch(receive_block_gen_event.timestamp),
                first_seven_base64_chars(receive_block_gen_event.origin.bytes()),
                first_seven_base64_chars(receive_block_gen_event.block.bytes()),
                receive_block_gen_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeadLetterEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |dead_letter_event: &DeadLetterEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DEAD_LETTER,
                secs_since_unix_epoch(dead_letter_event.timestamp),
                dead_letter_event.height,
                dead_letter_event.transactions.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExpireTransactionsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |expire_transactions_event: &ExpireTransactionsEvent| {
            log::info!(
                "{}, {}, {}",
                EXPIRE_TRANSACTIONS,
                secs_since_unix_epoch(expire_transactions_event.timestamp),
                expire_transactions_event.transactions.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_vote_event: &RoundVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ROUND_VOTE,
                secs_since_unix_epoch(round_vote_event.timestamp),
                round_vote_event.target_height,
                round_vote_event.timeout_count,
                first_seven_base64_chars(round_vote_event.generator.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundVoteAckEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_vote_ack_event: &RoundVoteAckEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ROUND_VOTE_ACK,
                secs_since_unix_epoch(round_vote_ack_event.timestamp),
                round_vote_ack_event.target_height,
                round_vote_ack_event.timeout_count,
                first_seven_base64_chars(round_vote_ack_event.nominated.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for BlockVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |block_vote_event: &BlockVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BLOCK_VOTE,
                secs_since_unix_epoch(block_vote_event.timestamp),
                first_seven_base64_chars(block_vote_event.block.bytes()),
                block_vote_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for GeneratorTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |generator_timeout_event: &GeneratorTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                GENERATOR_TIMEOUT,
                secs_since_unix_epoch(generator_timeout_event.timestamp),
                generator_timeout_event.target_height,
                first_seven_base64_chars(generator_timeout_event.generator.bytes()),
                generator_timeout_event.disconnected
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestBlocksEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_blocks_event: &RequestBlocksEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REQUEST_BLOCKS,
                secs_since_unix_epoch(request_blocks_event.timestamp),
                first_seven_base64_chars(request_blocks_event.peer.bytes()),
                request_blocks_event.height,
                request_blocks_event.count
            )
        };
        Box::new(logger)
    }
}

impl Logger for ServeBlocksEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |serve_blocks_event: &ServeBlocksEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                SERVE_BLOCKS,
                secs_since_unix_epoch(serve_blocks_event.timestamp),
                first_seven_base64_chars(serve_blocks_event.peer.bytes()),
                serve_blocks_event.height,
                serve_blocks_event.count,
                serve_blocks_event.from_batch_cache
            )
        };
        Box::new(logger)
    }
}

impl Logger for ForkDetectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |fork_detected_event: &ForkDetectedEvent| {
            log::error!(
                "{}, {}, {}, {}, {}, {}",
                FORK_DETECTED,
                secs_since_unix_epoch(fork_detected_event.timestamp),
                first_seven_base64_chars(fork_detected_event.peer.bytes()),
                fork_detected_event.height,
                first_seven_base64_chars(fork_detected_event.local.bytes()),
                first_seven_base64_chars(fork_detected_event.remote.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RemovePeerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |remove_peer_event: &RemovePeerEvent| {
            log::info!(
                "{}, {}, {}, {}",
                REMOVE_PEER,
                secs_since_unix_epoch(remove_peer_event.timestamp),
                first_seven_base64_chars(remove_peer_event.peer.bytes()),
                remove_peer_event.reason
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
