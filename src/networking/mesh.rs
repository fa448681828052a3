/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Mesh) for the peer-to-peer meshes the roles talk over, and the poller that
//! distributes what a mesh receives to the threads that consume it.
//!
//! pof_rs ships TCP and WebSocket implementations ([`NodeMesh`](super::node_mesh::NodeMesh),
//! [`ObserverMesh`](super::observer_mesh::ObserverMesh),
//! [`GeneratorService`](super::generator_service::GeneratorService), and
//! [`ObserverLink`](super::observer_link::ObserverLink)), but any type implementing `Mesh` can be plugged
//! into a role, e.g., an in-memory transport in tests.

use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError, TrySendError},
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use crate::{
    events::{Event, RemovePeerEvent},
    types::data_types::PublicKey,
};

use super::codec::Envelope;

/// Capacity of each channel between the poller and a consumer.
pub const ROUTE_CAPACITY: usize = 1000;

/// Packets are complete frames as produced by [`encode_packet`](super::codec::encode_packet).
pub trait Mesh: Clone + Send + 'static {
    /// Send a packet to every connected peer without blocking.
    fn broadcast(&mut self, packet: &[u8]);

    /// Send a packet to every connected peer except `except`.
    fn except_cast(&mut self, except: &PublicKey, packet: &[u8]);

    fn send_to(&mut self, peer: &PublicKey, packet: &[u8]);

    /// Send a packet to any one connected peer. Returns false if no peer is connected.
    fn send_anyone(&mut self, packet: &[u8]) -> bool;

    fn peers(&self) -> Vec<PublicKey>;

    /// Charge `peer` for a protocol violation. Returns true if the peer crossed the limit and was
    /// removed.
    fn add_bad_point(&mut self, peer: &PublicKey, points: u32) -> bool;

    fn remove_peer(&mut self, peer: &PublicKey);

    /// Receive a packet from any peer. Returns immediately with a None if no packet is available now.
    fn recv(&mut self) -> Option<(PublicKey, Vec<u8>)>;
}

/// Which consumer each packet type goes to.
pub(crate) struct Routes {
    routes: HashMap<u32, SyncSender<(PublicKey, Envelope)>>,
}

impl Routes {
    pub(crate) fn new() -> Routes {
        Routes {
            routes: HashMap::new(),
        }
    }

    /// Open a channel that receives every packet whose type id is in `type_ids`.
    pub(crate) fn route(&mut self, type_ids: &[u32]) -> Receiver<(PublicKey, Envelope)> {
        let (sender, receiver) = mpsc::sync_channel(ROUTE_CAPACITY);
        for type_id in type_ids {
            self.routes.insert(*type_id, sender.clone());
        }
        receiver
    }
}

/// Spawn the poller thread, which polls `mesh`, decodes every packet, and forwards it along its route.
///
/// A packet that does not decode gets its sender removed from the mesh.
pub(crate) fn start_polling<M: Mesh>(
    mut mesh: M,
    routes: Routes,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        let Some((origin, packet)) = mesh.recv() else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        let envelope = match Envelope::decode(&packet) {
            Ok(envelope) => envelope,
            Err(err) => {
                remove_peer(&mut mesh, &origin, &format!("invalid packet: {}", err), &event_publisher);
                continue;
            }
        };
        match routes.routes.get(&envelope.type_id) {
            Some(route) => match route.try_send((origin, envelope)) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => (),
                Err(TrySendError::Full((_, envelope))) => {
                    log::debug!("RouteFull, {}, {}", envelope.type_name(), origin)
                }
            },
            None => log::debug!("Unrouted, {}, {}", envelope.type_name(), origin),
        }
    })
}

/// Remove `peer` from `mesh`, logging and publishing the reason.
pub(crate) fn remove_peer<M: Mesh>(
    mesh: &mut M,
    peer: &PublicKey,
    reason: &str,
    event_publisher: &Option<Sender<Event>>,
) {
    log::warn!("RemovePeer, {}, {}", peer, reason);
    mesh.remove_peer(peer);
    Event::publish(
        event_publisher,
        Event::RemovePeer(RemovePeerEvent {
            timestamp: SystemTime::now(),
            peer: *peer,
            reason: reason.to_string(),
        }),
    );
}

/// Charge `peer` `points` bad points, publishing a removal if that crossed the limit.
pub(crate) fn penalize<M: Mesh>(
    mesh: &mut M,
    peer: &PublicKey,
    points: u32,
    reason: &str,
    event_publisher: &Option<Sender<Event>>,
) {
    log::debug!("BadPoint, {}, {}, {}", peer, points, reason);
    if mesh.add_bad_point(peer, points) {
        log::warn!("RemovePeer, {}, bad points: {}", peer, reason);
        Event::publish(
            event_publisher,
            Event::RemovePeer(RemovePeerEvent {
                timestamp: SystemTime::now(),
                peer: *peer,
                reason: format!("bad points: {}", reason),
            }),
        );
    }
}
