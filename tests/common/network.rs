//! An in-memory [`Mesh`] that passes packets between threads using channels.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pof_rs::{
    networking::{generator_service::GeneratorGate, mesh::Mesh, peer_set::BAD_POINT_LIMIT},
    types::data_types::{Address, PublicKey},
};

type Inbox = Receiver<(PublicKey, Vec<u8>)>;

struct HubState {
    bipartite: bool,
    sides: HashMap<PublicKey, u8>,
    inboxes: HashMap<PublicKey, Sender<(PublicKey, Vec<u8>)>>,
    cut: HashSet<(PublicKey, PublicKey)>,
    muted: HashSet<PublicKey>,
    bad_points: HashMap<(PublicKey, PublicKey), u32>,
}

impl HubState {
    fn linked(&self, a: &PublicKey, b: &PublicKey) -> bool {
        a != b
            && self.inboxes.contains_key(a)
            && self.inboxes.contains_key(b)
            && (!self.bipartite || self.sides.get(a) != self.sides.get(b))
            && !self.cut.contains(&(*a, *b))
    }

    fn deliver(&self, from: &PublicKey, to: &PublicKey, packet: &[u8]) -> bool {
        if !self.linked(from, to) || self.muted.contains(from) {
            return false;
        }
        match self.inboxes.get(to) {
            Some(inbox) => inbox.send((*from, packet.to_vec())).is_ok(),
            None => false,
        }
    }

    fn peers_of(&self, me: &PublicKey) -> Vec<PublicKey> {
        let mut peers: Vec<PublicKey> = self
            .sides
            .keys()
            .filter(|peer| self.linked(me, peer))
            .copied()
            .collect();
        peers.sort();
        peers
    }

    fn cut(&mut self, a: &PublicKey, b: &PublicKey) {
        self.cut.insert((*a, *b));
        self.cut.insert((*b, *a));
    }
}

/// The switchboard every [`MeshStub`] of one mesh is plugged into.
///
/// In a full hub every stub is linked to every other. In a bipartite hub, stubs are only linked to the
/// stubs that joined on the other side, e.g., observers to generators.
#[derive(Clone)]
pub(crate) struct MeshHub(Arc<Mutex<HubState>>);

impl MeshHub {
    pub(crate) fn full() -> MeshHub {
        MeshHub::new(false)
    }

    pub(crate) fn bipartite() -> MeshHub {
        MeshHub::new(true)
    }

    fn new(bipartite: bool) -> MeshHub {
        MeshHub(Arc::new(Mutex::new(HubState {
            bipartite,
            sides: HashMap::new(),
            inboxes: HashMap::new(),
            cut: HashSet::new(),
            muted: HashSet::new(),
            bad_points: HashMap::new(),
        })))
    }

    /// Plug `key` into the hub on `side`, healing every link it had lost if it was plugged in before.
    /// The side only matters in a bipartite hub.
    pub(crate) fn join(&self, key: PublicKey, side: u8) -> MeshStub {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.0.lock().unwrap();
        state.cut.retain(|(a, b)| *a != key && *b != key);
        state.muted.remove(&key);
        state.bad_points.retain(|(a, b), _| *a != key && *b != key);
        state.sides.insert(key, side);
        state.inboxes.insert(key, sender);
        MeshStub {
            me: key,
            hub: self.0.clone(),
            inbox: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Unplug `key`. Its stub stops sending and receiving, and no peer sees it anymore.
    pub(crate) fn kill(&self, key: &PublicKey) {
        self.0.lock().unwrap().inboxes.remove(key);
    }

    /// Drop everything `key` sends from now on. Its peers still see it linked, as they would a peer that
    /// hangs without closing its connection.
    pub(crate) fn mute(&self, key: &PublicKey) {
        self.0.lock().unwrap().muted.insert(*key);
    }

    /// Plug a killed `key` back in on its old side.
    pub(crate) fn rejoin(&self, key: PublicKey) -> MeshStub {
        let side = self.0.lock().unwrap().sides.get(&key).copied().unwrap_or(0);
        self.join(key, side)
    }

    pub(crate) fn is_linked(&self, a: &PublicKey, b: &PublicKey) -> bool {
        self.0.lock().unwrap().linked(a, b)
    }
}

/// One peer's view of a [`MeshHub`].
#[derive(Clone)]
pub(crate) struct MeshStub {
    me: PublicKey,
    hub: Arc<Mutex<HubState>>,
    inbox: Arc<Mutex<Inbox>>,
}

impl Mesh for MeshStub {
    fn broadcast(&mut self, packet: &[u8]) {
        let state = self.hub.lock().unwrap();
        for peer in state.peers_of(&self.me) {
            state.deliver(&self.me, &peer, packet);
        }
    }

    fn except_cast(&mut self, except: &PublicKey, packet: &[u8]) {
        let state = self.hub.lock().unwrap();
        for peer in state.peers_of(&self.me) {
            if peer != *except {
                state.deliver(&self.me, &peer, packet);
            }
        }
    }

    fn send_to(&mut self, peer: &PublicKey, packet: &[u8]) {
        self.hub.lock().unwrap().deliver(&self.me, peer, packet);
    }

    fn send_anyone(&mut self, packet: &[u8]) -> bool {
        let state = self.hub.lock().unwrap();
        state
            .peers_of(&self.me)
            .iter()
            .any(|peer| state.deliver(&self.me, peer, packet))
    }

    fn peers(&self) -> Vec<PublicKey> {
        self.hub.lock().unwrap().peers_of(&self.me)
    }

    fn add_bad_point(&mut self, peer: &PublicKey, points: u32) -> bool {
        let mut state = self.hub.lock().unwrap();
        let total = state.bad_points.entry((self.me, *peer)).or_insert(0);
        *total += points;
        if *total >= BAD_POINT_LIMIT {
            state.cut(&self.me, peer);
            true
        } else {
            false
        }
    }

    fn remove_peer(&mut self, peer: &PublicKey) {
        self.hub.lock().unwrap().cut(&self.me, peer);
    }

    fn recv(&mut self) -> Option<(PublicKey, Vec<u8>)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(packet) => Some(packet),
            // Killed.
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl GeneratorGate for MeshStub {
    fn set_generators(&mut self, _: Vec<Address>) {}
}
