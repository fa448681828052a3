/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The catch-up protocol, which lets observers, generators, and nodes that fell behind fetch committed
//! blocks from their peers.
//!
//! Every role announces its tip in [`StatusMessage`](messages::StatusMessage)s. A role that sees a
//! higher tip requests the missing blocks with [`RequestMessage`](messages::RequestMessage)s, which the
//! peer's [`SyncServer`](server::SyncServer) answers with [`BlockMessage`](messages::BlockMessage)s.

pub mod client;

pub mod messages;

pub mod server;
