/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Peer discovery messages, handled inside [`NodeMesh`](super::node_mesh::NodeMesh).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::PublicKey;

use super::codec::Packet;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestPeerListMessage {}

impl Packet for RequestPeerListMessage {
    const TYPE_NAME: &'static str = "pof_rs::networking::RequestPeerListMessage";
}

/// Bind addresses of the sender's connected peers.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PeerListMessage {
    pub peers: Vec<PeerEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PeerEntry {
    pub address: String,
    pub public_key: PublicKey,
}

impl Packet for PeerListMessage {
    const TYPE_NAME: &'static str = "pof_rs::networking::PeerListMessage";
}
