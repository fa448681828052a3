/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! pof_rs is a library for replicating a permissioned chain with Proof-of-Formulator consensus.
//!
//! To run a role, implement [`Application`](context::application::Application) and
//! [`KVStore`](store::pluggables::KVStore), [initialize](replica::initialize) a chain store with the
//! genesis, and start one of the role specs in [`replica`].

pub mod config;

pub mod consensus;

pub mod context;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod networking;

pub(crate) mod node;

pub mod replica;

pub mod store;

pub mod sync;

pub mod txpool;

pub mod types;
