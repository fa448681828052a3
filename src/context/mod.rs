/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic block execution on top of the chain store.
//!
//! A [`Context`] is the state a block executes against. The [`Committer`](committer::Committer)
//! validates and executes received blocks and appends them to the store, while the
//! [`BlockBuilder`](builder::BlockBuilder) executes transactions one at a time as a generator assembles a
//! block. Both dispatch transactions to the library user's [`Application`](application::Application)
//! and consult a [`ConsensusHook`](hook::ConsensusHook) for the rules of block production.

pub mod application;

pub mod builder;

pub mod committer;

pub mod errors;

pub mod hook;

mod overlay;
pub use overlay::Context;
