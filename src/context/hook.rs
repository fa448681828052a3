/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::block::{Block, Header};

use super::{errors::ChainError, Context};

/// The consensus rules the committer enforces on every block, independently of the application.
///
/// pof_rs ships one implementation, [`PofConsensus`](crate::consensus::pof::PofConsensus).
pub trait ConsensusHook: Send + Sync + 'static {
    /// Check that `header` was produced by the generator whose turn it is, then advance the consensus
    /// state stored in `ctx`. Called after the block's transactions, on both the producing and the
    /// validating side.
    fn apply_block(&self, ctx: &mut Context, header: &Header) -> Result<(), ChainError>;

    /// Check the generator and observer signatures attached to a block before it is connected.
    fn validate_signatures(&self, block: &Block) -> Result<(), ChainError>;
}
