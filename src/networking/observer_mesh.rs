/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The full mesh between observers.
//!
//! Every observer listens for the others and also dials every observer in its address map that it has no
//! outbound connection to, so both directions may be open at once. Connections from keys outside the
//! map are refused after the handshake.

use std::{
    collections::BTreeMap,
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::types::{
    crypto_primitives::Keypair,
    data_types::{ChainID, PublicKey},
};

use super::{
    handshake::{accept_stream, dial},
    listener::{spawn_listener, spawn_ticker},
    mesh::Mesh,
    peer::{PeerError, TcpAsyncPeer},
    peer_set::{PeerSet, Side},
};

const DIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, TypedBuilder)]
pub struct ObserverMeshConfig {
    #[builder(setter(doc = "Set the observer's keypair. Required."))]
    pub keypair: Keypair,

    #[builder(setter(doc = "Set the chain id peers must share. Required."))]
    pub chain_id: ChainID,

    #[builder(setter(into, doc = "Set the address to listen on for other observers. Required."))]
    pub bind_address: String,

    #[builder(setter(doc = "Set the public key and mesh address of every observer, self included. Required."))]
    pub observers: BTreeMap<PublicKey, String>,
}

#[derive(Clone)]
pub struct ObserverMesh {
    peers: PeerSet,
    closed: Arc<AtomicBool>,
}

impl ObserverMesh {
    pub fn start(config: ObserverMeshConfig) -> Result<ObserverMesh, PeerError> {
        let listener = TcpListener::bind(&config.bind_address)?;
        let mesh = ObserverMesh {
            peers: PeerSet::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let peers = mesh.peers.clone();
        let accept_config = config.clone();
        spawn_listener(listener, mesh.closed.clone(), move |stream| {
            let result = accept_stream(
                &stream,
                &accept_config.keypair,
                accept_config.chain_id,
                &accept_config.bind_address,
            )
            .and_then(|outcome| {
                if !accept_config.observers.contains_key(&outcome.public_key) {
                    return Err(PeerError::NotAllowed(outcome.public_key));
                }
                TcpAsyncPeer::new(stream, outcome)
            });
            match result {
                Ok(peer) => peers.add(peer, Side::Server),
                Err(err) => log::debug!("ObserverMeshAccept, {}", err),
            }
        })?;

        let peers = mesh.peers.clone();
        spawn_ticker(DIAL_INTERVAL, mesh.closed.clone(), move || {
            let me = config.keypair.public();
            for (key, address) in &config.observers {
                if *key == me || peers.contains_on(key, Side::Client) {
                    continue;
                }
                let result = dial(address, &config.keypair, config.chain_id, &config.bind_address)
                    .and_then(|(stream, outcome)| {
                        if outcome.public_key != *key {
                            return Err(PeerError::NotAllowed(outcome.public_key));
                        }
                        TcpAsyncPeer::new(stream, outcome)
                    });
                match result {
                    Ok(peer) => peers.add(peer, Side::Client),
                    Err(err) => log::debug!("ObserverMeshDial, {}, {}", address, err),
                }
            }
        });

        Ok(mesh)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peers.close_all();
    }
}

impl Mesh for ObserverMesh {
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
