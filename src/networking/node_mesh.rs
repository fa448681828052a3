/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The gossip mesh between full nodes and generators.
//!
//! A `NodeMesh` accepts connections from anyone on the same chain, and dials the peers its
//! [`NodePool`] selects, re-selecting every [`ROTATION_INTERVAL`]. Peer-list requests and replies are
//! answered inside [`Mesh::recv`] and never reach the role.

use std::{
    collections::HashSet,
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use typed_builder::TypedBuilder;

use crate::{
    store::pluggables::KVStore,
    types::{
        crypto_primitives::Keypair,
        data_types::{ChainID, PublicKey},
    },
};

use super::{
    codec::{encode_packet, Envelope, Packet},
    handshake::{accept_stream, dial},
    listener::{spawn_listener, spawn_ticker},
    mesh::Mesh,
    messages::{PeerEntry, PeerListMessage, RequestPeerListMessage},
    node_pool::{NodePool, ROTATION_INTERVAL},
    peer::{PeerError, TcpAsyncPeer},
    peer_set::{PeerSet, Side},
};

/// How often the dialer checks for missing outbound connections between rotations.
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, TypedBuilder)]
pub struct NodeMeshConfig {
    #[builder(setter(doc = "Set the keypair the mesh authenticates with. Required."))]
    pub keypair: Keypair,

    #[builder(setter(doc = "Set the chain id peers must share. Required."))]
    pub chain_id: ChainID,

    #[builder(setter(
        into,
        doc = "Set the address to listen on. It is also advertised to peers. Required."
    ))]
    pub bind_address: String,

    #[builder(
        default,
        setter(doc = "Set addresses to dial while the node pool is empty. Defaults to none.")
    )]
    pub seeds: Vec<String>,
}

#[derive(Clone)]
pub struct NodeMesh<K: KVStore> {
    peers: PeerSet,
    pool: Arc<NodePool<K>>,
    public_key: PublicKey,
    closed: Arc<AtomicBool>,
}

impl<K: KVStore> NodeMesh<K> {
    /// Bind the listener and start the accept and dial threads.
    pub fn start(config: NodeMeshConfig, pool: NodePool<K>) -> Result<NodeMesh<K>, PeerError> {
        let listener = TcpListener::bind(&config.bind_address)?;
        let mesh = NodeMesh {
            peers: PeerSet::new(),
            pool: Arc::new(pool),
            public_key: config.keypair.public(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let accepting = mesh.clone();
        let accept_config = config.clone();
        spawn_listener(listener, mesh.closed.clone(), move |stream| {
            let outcome = match accept_stream(
                &stream,
                &accept_config.keypair,
                accept_config.chain_id,
                &accept_config.bind_address,
            ) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::debug!("NodeMeshAccept, {}", err);
                    return;
                }
            };
            if !outcome.bind_address.is_empty() {
                accepting.pool.insert(&outcome.bind_address, outcome.public_key);
            }
            match TcpAsyncPeer::new(stream, outcome) {
                Ok(peer) => accepting.peers.add(peer, Side::Server),
                Err(err) => log::debug!("NodeMeshAccept, {}", err),
            }
        })?;

        let dialing = mesh.clone();
        let mut last_rotation: Option<Instant> = None;
        spawn_ticker(REDIAL_INTERVAL, mesh.closed.clone(), move || {
            let rotate = last_rotation.map_or(true, |last| last.elapsed() >= ROTATION_INTERVAL);
            dialing.dial_selection(&config, rotate);
            if rotate {
                last_rotation = Some(Instant::now());
            }
        });

        Ok(mesh)
    }

    pub fn pool(&self) -> &NodePool<K> {
        &self.pool
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peers.close_all();
    }

    fn dial_selection(&self, config: &NodeMeshConfig, rotate: bool) {
        let mut exclude = HashSet::from([self.public_key]);
        let mut targets: Vec<(String, Option<PublicKey>)> = self
            .pool
            .select(&exclude)
            .into_iter()
            .map(|record| (record.address, Some(record.public_key)))
            .collect();
        if targets.is_empty() {
            targets = config.seeds.iter().map(|seed| (seed.clone(), None)).collect();
        }

        if rotate {
            let keep: HashSet<PublicKey> = targets.iter().filter_map(|(_, key)| *key).collect();
            for peer in self.peers.peers() {
                if self.peers.contains_on(&peer, Side::Client) && !keep.contains(&peer) {
                    self.peers.remove(&peer);
                }
            }
        }

        exclude.extend(self.peers.peers());
        for (address, expected) in targets {
            if expected.map_or(false, |key| exclude.contains(&key)) {
                continue;
            }
            let started = Instant::now();
            match dial(&address, &config.keypair, config.chain_id, &config.bind_address) {
                Ok((stream, outcome)) => {
                    self.pool.insert(&address, outcome.public_key);
                    self.pool.record_ping(&address, started.elapsed());
                    let key = outcome.public_key;
                    match TcpAsyncPeer::new(stream, outcome) {
                        Ok(peer) => {
                            self.peers.add(peer, Side::Client);
                            self.peers
                                .send_to(&key, encode_packet(&RequestPeerListMessage {}));
                        }
                        Err(err) => log::debug!("NodeMeshDial, {}, {}", address, err),
                    }
                }
                Err(err) => log::debug!("NodeMeshDial, {}, {}", address, err),
            }
        }
    }

    /// Handle peer discovery packets. Returns false for every other packet.
    fn handle_discovery(&self, origin: &PublicKey, frame: &[u8]) -> bool {
        let type_id = match frame.get(..4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => return false,
        };
        if type_id == RequestPeerListMessage::type_id() {
            let peers = self
                .peers
                .addresses()
                .into_iter()
                .filter(|(key, address)| key != origin && !address.is_empty())
                .map(|(public_key, address)| PeerEntry { address, public_key })
                .collect();
            self.peers
                .send_to(origin, encode_packet(&PeerListMessage { peers }));
            true
        } else if type_id == PeerListMessage::type_id() {
            match Envelope::decode(frame).and_then(|envelope| envelope.parse::<PeerListMessage>()) {
                Ok(list) => {
                    for entry in list.peers {
                        if entry.public_key != self.public_key {
                            self.pool.insert(&entry.address, entry.public_key);
                        }
                    }
                }
                Err(err) => {
                    log::debug!("PeerList, {}, {}", origin, err);
                    self.peers.add_bad_point(origin, 10);
                }
            }
            true
        } else {
            false
        }
    }
}

impl<K: KVStore> Mesh for NodeMesh<K> {
    fn broadcast(&mut self, packet: &[u8]) {
        self.peers.broadcast(packet)
    }

    fn except_cast(&mut self, except: &PublicKey, packet: &[u8]) {
        self.peers.except_cast(except, packet)
    }

    fn send_to(&mut self, peer: &PublicKey, packet: &[u8]) {
        self.peers.send_to(peer, packet.to_vec())
    }

    fn send_anyone(&mut self, packet: &[u8]) -> bool {
        self.peers.send_anyone(packet.to_vec())
    }

    fn peers(&self) -> Vec<PublicKey> {
        self.peers.peers()
    }

    fn add_bad_point(&mut self, peer: &PublicKey, points: u32) -> bool {
        self.peers.add_bad_point(peer, points)
    }

    fn remove_peer(&mut self, peer: &PublicKey) {
        self.peers.remove(peer)
    }

    fn recv(&mut self) -> Option<(PublicKey, Vec<u8>)> {
        loop {
            let (origin, frame) = self.peers.try_recv()?;
            if !self.handle_discovery(&origin, &frame) {
                return Some((origin, frame));
            }
        }
    }
}
