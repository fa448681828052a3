/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pending transactions: the [pool](pool::TransactionPool) generators build blocks from, and the
//! [admission pipeline](admission) that fills it from local submissions and gossip.

pub mod pool;

pub mod admission;

pub mod messages;
