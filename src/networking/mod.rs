/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Peer-to-peer networking.
//!
//! Roles talk over implementations of the [`Mesh`](mesh::Mesh) trait. The TCP and WebSocket meshes in
//! this module share the [`codec`] framing, the [`handshake`], and the [`PeerSet`](peer_set::PeerSet)
//! bookkeeping.

pub mod codec;

pub mod messages;

pub mod handshake;

pub mod peer;

pub mod peer_set;

pub mod mesh;

pub(crate) mod listener;

pub mod node_pool;

pub mod node_mesh;

pub mod observer_mesh;

pub mod generator_service;

pub mod observer_link;
