/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
    Arc,
};

use crate::{
    context::errors::ChainError,
    types::data_types::{Hash256, PublicKey},
};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("message does not fit the current round state")]
    InvalidRoundState,
    #[error("observer {0} already voted")]
    AlreadyVoted(PublicKey),
    #[error("invalid vote")]
    InvalidVote,
    #[error("peer {peer} has block {remote} at height {height}, local block is {local}")]
    FoundForkedBlock {
        peer: PublicKey,
        height: u32,
        local: Hash256,
        remote: Hash256,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Shared by every thread of a role. Once raised, the role stops appending blocks and the error is
/// handed to whoever holds the receiving end of the fatal channel.
#[derive(Clone)]
pub struct Halt {
    halted: Arc<AtomicBool>,
    fatal_errors: Sender<ConsensusError>,
}

impl Halt {
    pub(crate) fn new(fatal_errors: Sender<ConsensusError>) -> Halt {
        Halt {
            halted: Arc::new(AtomicBool::new(false)),
            fatal_errors,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn raise(&self, error: ConsensusError) {
        log::error!("Halt, {}", error);
        self.halted.store(true, Ordering::SeqCst);
        // The receiving end may already be gone if the role handle was dropped.
        let _ = self.fatal_errors.send(error);
    }
}
