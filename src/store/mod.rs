/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable chain state.
//!
//! The [`ChainStore`](chain_store::ChainStore) combines a user-provided [`KVStore`](pluggables::KVStore)
//! holding headers and state with a [`BlockPile`](pile::BlockPile) holding block bodies.

pub mod pluggables;

pub mod variables;

pub mod pile;

pub mod chain_store;
