/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of live peers behind every TCP and WebSocket mesh.
//!
//! Peers are kept in two maps, one for connections we dialed (client side) and one for connections we
//! accepted (server side), both keyed by the peer's public key. A new connection replaces and closes an
//! older one on the same side; connections on opposite sides may co-exist, and sends go through the
//! client side first.
//!
//! Every peer gets a reader thread that pushes its frames into one bounded inbox, so a slow consumer
//! applies backpressure to the readers without reordering any single peer's frames.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TryRecvError},
        Arc, Mutex, Weak,
    },
    thread,
};

use rand::seq::IteratorRandom;

use crate::types::data_types::PublicKey;

use super::peer::Peer;

pub const INBOX_CAPACITY: usize = 1000;
pub const BAD_POINT_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Clone)]
pub struct PeerSet {
    inner: Arc<PeerSetInner>,
}

struct PeerSetInner {
    maps: Mutex<PeerMaps>,
    inbox_sender: SyncSender<(PublicKey, Vec<u8>)>,
    inbox: Mutex<Receiver<(PublicKey, Vec<u8>)>>,
    next_serial: AtomicU64,
}

#[derive(Default)]
struct PeerMaps {
    client: HashMap<PublicKey, Entry>,
    server: HashMap<PublicKey, Entry>,
    bad_points: HashMap<PublicKey, u32>,
}

struct Entry {
    serial: u64,
    peer: Arc<dyn Peer>,
}

impl PeerMaps {
    fn side(&mut self, side: Side) -> &mut HashMap<PublicKey, Entry> {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn get(&self, id: &PublicKey) -> Option<&Arc<dyn Peer>> {
        self.client
            .get(id)
            .or_else(|| self.server.get(id))
            .map(|entry| &entry.peer)
    }

    /// One live peer per key.
    fn unique(&self) -> BTreeMap<PublicKey, &Arc<dyn Peer>> {
        let mut unique = BTreeMap::new();
        for (id, entry) in self.server.iter().chain(self.client.iter()) {
            unique.insert(*id, &entry.peer);
        }
        unique
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> PeerSet {
        let (inbox_sender, inbox) = mpsc::sync_channel(INBOX_CAPACITY);
        PeerSet {
            inner: Arc::new(PeerSetInner {
                maps: Mutex::new(PeerMaps::default()),
                inbox_sender,
                inbox: Mutex::new(inbox),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    /// Start serving `peer`. An older connection to the same key on the same side is closed.
    pub fn add(&self, peer: Arc<dyn Peer>, side: Side) {
        let id = peer.id();
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .inner
            .maps
            .lock()
            .unwrap()
            .side(side)
            .insert(id, Entry { serial, peer: peer.clone() });
        if let Some(replaced) = replaced {
            replaced.peer.close();
        }

        let inbox = self.inner.inbox_sender.clone();
        let set = Arc::downgrade(&self.inner);
        thread::spawn(move || {
            loop {
                match peer.read() {
                    Ok(frame) => {
                        if inbox.send((id, frame)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::debug!("PeerRead, {}, {}", id, err);
                        break;
                    }
                }
            }
            peer.close();
            forget(&set, side, &id, serial);
        });
    }

    pub fn contains(&self, id: &PublicKey) -> bool {
        self.inner.maps.lock().unwrap().get(id).is_some()
    }

    pub fn contains_on(&self, id: &PublicKey, side: Side) -> bool {
        self.inner.maps.lock().unwrap().side(side).contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.maps.lock().unwrap().unique().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<PublicKey> {
        self.inner.maps.lock().unwrap().unique().into_keys().collect()
    }

    /// The advertised bind address of every connected peer.
    pub fn addresses(&self) -> Vec<(PublicKey, String)> {
        self.inner
            .maps
            .lock()
            .unwrap()
            .unique()
            .into_iter()
            .map(|(id, peer)| (id, peer.bind_address().to_string()))
            .collect()
    }

    pub fn send_to(&self, id: &PublicKey, frame: Vec<u8>) {
        if let Some(peer) = self.inner.maps.lock().unwrap().get(id) {
            peer.send(frame);
        }
    }

    pub fn broadcast(&self, frame: &[u8]) {
        for peer in self.inner.maps.lock().unwrap().unique().values() {
            peer.send(frame.to_vec());
        }
    }

    pub fn except_cast(&self, except: &PublicKey, frame: &[u8]) {
        for (id, peer) in self.inner.maps.lock().unwrap().unique() {
            if id != *except {
                peer.send(frame.to_vec());
            }
        }
    }

    /// Send to one connected peer chosen at random. Returns false if there is none.
    pub fn send_anyone(&self, frame: Vec<u8>) -> bool {
        let maps = self.inner.maps.lock().unwrap();
        match maps.unique().into_values().choose(&mut rand::thread_rng()) {
            Some(peer) => {
                peer.send(frame);
                true
            }
            None => false,
        }
    }

    /// Add bad points to `id`. Returns true if this pushed it over [`BAD_POINT_LIMIT`] and it was
    /// removed.
    pub fn add_bad_point(&self, id: &PublicKey, points: u32) -> bool {
        let total = {
            let mut maps = self.inner.maps.lock().unwrap();
            let total = maps.bad_points.entry(*id).or_insert(0);
            *total += points;
            *total
        };
        if total >= BAD_POINT_LIMIT {
            self.remove(id);
            true
        } else {
            false
        }
    }

    /// Close and forget every connection to `id`.
    pub fn remove(&self, id: &PublicKey) {
        let removed: Vec<Entry> = {
            let mut maps = self.inner.maps.lock().unwrap();
            maps.bad_points.remove(id);
            [maps.client.remove(id), maps.server.remove(id)]
                .into_iter()
                .flatten()
                .collect()
        };
        for entry in removed {
            entry.peer.close();
        }
    }

    /// Take the next received frame without blocking.
    pub fn try_recv(&self) -> Option<(PublicKey, Vec<u8>)> {
        match self.inner.inbox.lock().unwrap().try_recv() {
            Ok(received) => Some(received),
            Err(TryRecvError::Empty) => None,
            // The set holds a sender itself, so the inbox cannot disconnect.
            Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn close_all(&self) {
        let mut guard = self.inner.maps.lock().unwrap();
        let maps = &mut *guard;
        for (_, entry) in maps.client.drain().chain(maps.server.drain()) {
            entry.peer.close();
        }
        maps.bad_points.clear();
    }
}

fn forget(set: &Weak<PeerSetInner>, side: Side, id: &PublicKey, serial: u64) {
    if let Some(set) = set.upgrade() {
        let mut maps = set.maps.lock().unwrap();
        let map = maps.side(side);
        if map.get(id).map_or(false, |entry| entry.serial == serial) {
            map.remove(id);
        }
    }
}
