/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Proof-of-Formulator consensus protocol.
//!
//! Observers agree, through a [vote round](vote_round), on which generator produces the next blocks and
//! which observer asks it to. The nominated [generator](generator) produces a turn of consecutive
//! blocks, which the [observers](observer) execute, sign, and commit once a majority of them signed.
//!
//! Who may generate next is decided by the [rank table](rank_table), which every block advances and which
//! is stored in the chain's state, so that every role computes the same table at every height. The
//! [`PofConsensus`](pof::PofConsensus) hook enforces the protocol's rules on every block a committer
//! connects.

pub mod errors;

pub(crate) mod generator;

pub mod messages;

pub(crate) mod observer;

pub mod pof;

pub mod rank_table;

pub mod vote_round;
