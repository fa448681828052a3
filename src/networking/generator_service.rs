/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The observer side of the generator link: a WebSocket server that only admits generators.
//!
//! The set of admitted addresses is the rank table of the chain tip. The observer role refreshes it after
//! every commit through [`GeneratorService::set_generators`]. A generator that reconnects replaces its
//! previous connection.

use std::{
    collections::HashSet,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use tungstenite::HandshakeError;
use typed_builder::TypedBuilder;

use crate::types::{
    crypto_primitives::Keypair,
    data_types::{Address, ChainID, PublicKey},
};

use super::{
    handshake::{handshake, DIAL_TIMEOUT},
    listener::spawn_listener,
    mesh::Mesh,
    peer::{Peer, PeerError, WebsocketPeer},
    peer_set::{PeerSet, Side},
};

#[derive(Clone, TypedBuilder)]
pub struct GeneratorServiceConfig {
    #[builder(setter(doc = "Set the observer's keypair. Required."))]
    pub keypair: Keypair,

    #[builder(setter(doc = "Set the chain id generators must share. Required."))]
    pub chain_id: ChainID,

    #[builder(setter(into, doc = "Set the address to listen on for generators. Required."))]
    pub bind_address: String,
}

#[derive(Clone)]
pub struct GeneratorService {
    peers: PeerSet,
    generators: Arc<RwLock<HashSet<Address>>>,
    closed: Arc<AtomicBool>,
}

impl GeneratorService {
    pub fn start(config: GeneratorServiceConfig) -> Result<GeneratorService, PeerError> {
        let listener = TcpListener::bind(&config.bind_address)?;
        let service = GeneratorService {
            peers: PeerSet::new(),
            generators: Arc::new(RwLock::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let accepting = service.clone();
        spawn_listener(listener, service.closed.clone(), move |stream| {
            match accepting.accept(stream, &config) {
                Ok(peer) => accepting.peers.add(peer, Side::Server),
                Err(err) => log::debug!("GeneratorServiceAccept, {}", err),
            }
        })?;
        Ok(service)
    }

    fn accept(
        &self,
        stream: TcpStream,
        config: &GeneratorServiceConfig,
    ) -> Result<Arc<dyn Peer>, PeerError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DIAL_TIMEOUT))?;
        let mut socket = tungstenite::accept(stream).map_err(|err| match err {
            HandshakeError::Failure(err) => PeerError::WebSocket(err),
            HandshakeError::Interrupted(_) => PeerError::InvalidHandshake("websocket upgrade interrupted"),
        })?;
        let outcome = handshake(&mut socket, &config.keypair, config.chain_id, &config.bind_address)?;
        let address = Address::from_public_key(&outcome.public_key)?;
        if !self.is_generator(&address) {
            return Err(PeerError::NotAllowed(outcome.public_key));
        }
        Ok(WebsocketPeer::new(socket, outcome)?)
    }

    pub fn is_generator(&self, address: &Address) -> bool {
        self.generators.read().unwrap().contains(address)
    }

    /// Replace the set of admitted generators. Connected generators outside the new set are dropped.
    pub fn set_generators(&self, generators: impl IntoIterator<Item = Address>) {
        let generators: HashSet<Address> = generators.into_iter().collect();
        for peer in self.peers.peers() {
            let admitted = Address::from_public_key(&peer)
                .map_or(false, |address| generators.contains(&address));
            if !admitted {
                self.peers.remove(&peer);
            }
        }
        *self.generators.write().unwrap() = generators;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peers.close_all();
    }
}

/// A generator-facing mesh whose membership follows the rank table.
pub trait GeneratorGate: Mesh {
    /// Admit only `generators` from now on.
    fn set_generators(&mut self, generators: Vec<Address>);
}

impl GeneratorGate for GeneratorService {
    fn set_generators(&mut self, generators: Vec<Address>) {
        GeneratorService::set_generators(self, generators)
    }
}

impl Mesh for GeneratorService {
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
        self.peers.try_recv()
    }
}
