/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The generator side of the generator link: WebSocket connections to every observer's
//! [`GeneratorService`](super::generator_service::GeneratorService), redialed while missing.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tungstenite::HandshakeError;
use typed_builder::TypedBuilder;

use crate::types::{
    crypto_primitives::Keypair,
    data_types::{ChainID, PublicKey},
};

use super::{
    handshake::{connect, handshake, DIAL_TIMEOUT},
    listener::spawn_ticker,
    mesh::Mesh,
    peer::{Peer, PeerError, WebsocketPeer},
    peer_set::{PeerSet, Side},
};

const DIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, TypedBuilder)]
pub struct ObserverLinkConfig {
    #[builder(setter(doc = "Set the generator's keypair. Required."))]
    pub keypair: Keypair,

    #[builder(setter(doc = "Set the chain id observers must share. Required."))]
    pub chain_id: ChainID,

    #[builder(setter(doc = "Set the public key and generator-service address of every observer. Required."))]
    pub observers: BTreeMap<PublicKey, String>,
}

#[derive(Clone)]
pub struct ObserverLink {
    peers: PeerSet,
    closed: Arc<AtomicBool>,
}

impl ObserverLink {
    pub fn start(config: ObserverLinkConfig) -> ObserverLink {
        let link = ObserverLink {
            peers: PeerSet::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let peers = link.peers.clone();
        spawn_ticker(DIAL_INTERVAL, link.closed.clone(), move || {
            for (key, address) in &config.observers {
                if peers.contains(key) {
                    continue;
                }
                match dial_observer(&config, key, address) {
                    Ok(peer) => peers.add(peer, Side::Client),
                    Err(err) => log::debug!("ObserverLinkDial, {}, {}", address, err),
                }
            }
        });
        link
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peers.close_all();
    }
}

fn dial_observer(
    config: &ObserverLinkConfig,
    expected: &PublicKey,
    address: &str,
) -> Result<Arc<dyn Peer>, PeerError> {
    let stream = connect(address)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(DIAL_TIMEOUT))?;
    let (mut socket, _) =
        tungstenite::client(format!("ws://{}/", address), stream).map_err(|err| match err {
            HandshakeError::Failure(err) => PeerError::WebSocket(err),
            HandshakeError::Interrupted(_) => PeerError::InvalidHandshake("websocket upgrade interrupted"),
        })?;
    let outcome = handshake(&mut socket, &config.keypair, config.chain_id, "")?;
    if outcome.public_key != *expected {
        return Err(PeerError::NotAllowed(outcome.public_key));
    }
    Ok(WebsocketPeer::new(socket, outcome)?)
}

impl Mesh for ObserverLink {
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
