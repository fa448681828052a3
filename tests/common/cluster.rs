//! Assembles observers, generators, and nodes over in-memory meshes.
//!
//! The three meshes of a network are:
//! - the observer hub, a full mesh between observers,
//! - the generator hub, a bipartite mesh between observers (side 0) and generators (side 1),
//! - the node hub, a full mesh between generators and nodes.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use pof_rs::{
    config::ProtocolParams,
    context::application::Application,
    replica::{
        initialize, GeneratorConfiguration, GeneratorReplica, GeneratorSpec, GenesisConfig, NodeConfiguration,
        NodeReplica, NodeSpec, ObserverConfiguration, ObserverReplica, ObserverSpec,
    },
    store::{chain_store::ChainStore, pile::MemPile},
    types::{
        crypto_primitives::Keypair,
        data_types::{Address, ChainID, Hash256, PublicKey},
    },
};

use super::{
    keys::{self, addresses, public_keys},
    logging::first_seven_base64_chars,
    mem_db::MemDB,
    network::MeshHub,
    token_app::TokenApp,
};

pub(crate) const CHAIN_ID: ChainID = ChainID::new(7);
pub(crate) const STATUS_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const BLOCK_TIME: Duration = Duration::from_millis(200);

pub(crate) const OBSERVER_SIDE: u8 = 0;
pub(crate) const GENERATOR_SIDE: u8 = 1;

pub(crate) fn params() -> ProtocolParams {
    ProtocolParams::builder()
        .chain_id(CHAIN_ID)
        .block_time(BLOCK_TIME)
        .max_blocks_per_generator(3)
        .build()
}

pub(crate) fn genesis(generators: &[Keypair]) -> GenesisConfig {
    GenesisConfig::builder()
        .generators(addresses(generators))
        .admins(vec![keys::admin().address()])
        .build()
}

/// A fresh in-memory store holding the genesis of a chain produced by `generators`.
pub(crate) fn new_store(generators: &[Keypair]) -> ChainStore<MemDB> {
    let store = ChainStore::open(MemDB::new(), Arc::new(MemPile::new())).unwrap();
    initialize(&store, &TokenApp, &params(), &genesis(generators)).unwrap();
    store
}

fn app() -> Arc<dyn Application> {
    Arc::new(TokenApp)
}

/// Events recorded from every role of a cluster, tagged with the public key of the role.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    pub(crate) commits: Arc<Mutex<Vec<(PublicKey, u32, Hash256)>>>,
    pub(crate) generator_timeouts: Arc<Mutex<Vec<(u32, Address)>>>,
    pub(crate) forks: Arc<Mutex<Vec<(PublicKey, PublicKey, u32)>>>,
    pub(crate) requests: Arc<Mutex<Vec<(PublicKey, u32, u32)>>>,
    pub(crate) serves: Arc<Mutex<Vec<(u32, u32, bool)>>>,
    pub(crate) expirations: Arc<Mutex<Vec<Hash256>>>,
}

impl Recorder {
    pub(crate) fn generator_timeouts(&self) -> Vec<(u32, Address)> {
        self.generator_timeouts.lock().unwrap().clone()
    }

    pub(crate) fn forks(&self) -> Vec<(PublicKey, PublicKey, u32)> {
        self.forks.lock().unwrap().clone()
    }

    pub(crate) fn requests_by(&self, requester: &PublicKey) -> Vec<(u32, u32)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(by, _, _)| by == requester)
            .map(|(_, height, count)| (*height, *count))
            .collect()
    }

    pub(crate) fn serves(&self) -> Vec<(u32, u32, bool)> {
        self.serves.lock().unwrap().clone()
    }

    pub(crate) fn expirations(&self) -> Vec<Hash256> {
        self.expirations.lock().unwrap().clone()
    }
}

pub(crate) struct Cluster {
    pub(crate) params: ProtocolParams,
    pub(crate) observer_keys: Vec<Keypair>,
    pub(crate) generator_keys: Vec<Keypair>,
    pub(crate) node_keys: Vec<Keypair>,
    pub(crate) observer_hub: MeshHub,
    pub(crate) generator_hub: MeshHub,
    pub(crate) node_hub: MeshHub,
    pub(crate) observer_stores: Vec<ChainStore<MemDB>>,
    pub(crate) generator_stores: Vec<ChainStore<MemDB>>,
    pub(crate) node_stores: Vec<ChainStore<MemDB>>,
    pub(crate) observers: Vec<Option<ObserverReplica<MemDB>>>,
    pub(crate) generators: Vec<Option<GeneratorReplica<MemDB>>>,
    pub(crate) nodes: Vec<Option<NodeReplica<MemDB>>>,
    pub(crate) recorder: Recorder,
}

impl Cluster {
    /// Create the stores and meshes of a network. No role is started yet.
    pub(crate) fn new(observers: u16, generators: u16, nodes: u16) -> Cluster {
        Cluster::with_params(observers, generators, nodes, params())
    }

    pub(crate) fn with_params(observers: u16, generators: u16, nodes: u16, params: ProtocolParams) -> Cluster {
        let observer_keys = keys::observer_keypairs(observers);
        let generator_keys = keys::generator_keypairs(generators);
        let node_keys: Vec<Keypair> = (0..nodes).map(|i| keys::keypair(0xD0, i)).collect();

        Cluster {
            params,
            observer_stores: observer_keys.iter().map(|_| new_store(&generator_keys)).collect(),
            generator_stores: generator_keys.iter().map(|_| new_store(&generator_keys)).collect(),
            node_stores: node_keys.iter().map(|_| new_store(&generator_keys)).collect(),
            observers: observer_keys.iter().map(|_| None).collect(),
            generators: generator_keys.iter().map(|_| None).collect(),
            nodes: node_keys.iter().map(|_| None).collect(),
            observer_keys,
            generator_keys,
            node_keys,
            observer_hub: MeshHub::full(),
            generator_hub: MeshHub::bipartite(),
            node_hub: MeshHub::full(),
            recorder: Recorder::default(),
        }
    }

    pub(crate) fn start_all(&mut self) {
        self.start_generators();
        self.start_nodes();
        self.start_observers();
    }

    pub(crate) fn start_observers(&mut self) {
        (0..self.observer_keys.len()).for_each(|i| self.start_observer(i));
    }

    pub(crate) fn start_generators(&mut self) {
        (0..self.generator_keys.len()).for_each(|i| self.start_generator(i));
    }

    pub(crate) fn start_nodes(&mut self) {
        (0..self.node_keys.len()).for_each(|i| self.start_node(i));
    }

    pub(crate) fn start_observer(&mut self, i: usize) {
        let keypair = self.observer_keys[i].clone();
        let me = keypair.public();
        let configuration = ObserverConfiguration::builder()
            .keypair(keypair)
            .params(self.params.clone())
            .observers(public_keys(&self.observer_keys))
            .status_interval(STATUS_INTERVAL)
            .build();

        let replica = ObserverSpec::builder()
            .app(app())
            .store(self.observer_stores[i].clone())
            .observer_mesh(self.observer_hub.join(me, OBSERVER_SIDE))
            .generator_mesh(self.generator_hub.join(me, OBSERVER_SIDE))
            .configuration(configuration)
            .on_commit_block(commit_block_handler(me, &self.recorder))
            .on_generator_timeout(generator_timeout_handler(&self.recorder))
            .on_fork_detected(fork_detected_handler(me, &self.recorder))
            .on_request_blocks(request_blocks_handler(me, &self.recorder))
            .on_serve_blocks(serve_blocks_handler(&self.recorder))
            .build()
            .start()
            .unwrap();
        self.observers[i] = Some(replica);
    }

    pub(crate) fn start_generator(&mut self, i: usize) {
        let keypair = self.generator_keys[i].clone();
        let me = keypair.public();
        let configuration = GeneratorConfiguration::builder()
            .keypair(keypair)
            .params(self.params.clone())
            .observers(public_keys(&self.observer_keys))
            .tx_wait_workers(2)
            .status_interval(STATUS_INTERVAL)
            .build();

        let replica = GeneratorSpec::builder()
            .app(app())
            .store(self.generator_stores[i].clone())
            .node_mesh(self.node_hub.join(me, 0))
            .observer_link(self.generator_hub.join(me, GENERATOR_SIDE))
            .configuration(configuration)
            .on_commit_block(commit_block_handler(me, &self.recorder))
            .on_expire_transactions(expire_transactions_handler(&self.recorder))
            .on_fork_detected(fork_detected_handler(me, &self.recorder))
            .on_request_blocks(request_blocks_handler(me, &self.recorder))
            .on_serve_blocks(serve_blocks_handler(&self.recorder))
            .build()
            .start()
            .unwrap();
        self.generators[i] = Some(replica);
    }

    pub(crate) fn start_node(&mut self, i: usize) {
        let me = self.node_keys[i].public();
        let configuration = NodeConfiguration::builder()
            .params(self.params.clone())
            .observers(public_keys(&self.observer_keys))
            .tx_wait_workers(1)
            .status_interval(STATUS_INTERVAL)
            .build();

        let replica = NodeSpec::builder()
            .app(app())
            .store(self.node_stores[i].clone())
            .node_mesh(self.node_hub.join(me, 0))
            .configuration(configuration)
            .on_commit_block(commit_block_handler(me, &self.recorder))
            .on_expire_transactions(expire_transactions_handler(&self.recorder))
            .on_fork_detected(fork_detected_handler(me, &self.recorder))
            .on_request_blocks(request_blocks_handler(me, &self.recorder))
            .on_serve_blocks(serve_blocks_handler(&self.recorder))
            .build()
            .start()
            .unwrap();
        self.nodes[i] = Some(replica);
    }

    /// Unplug observer `i` from its meshes and shut it down. Its store is kept for a restart.
    pub(crate) fn stop_observer(&mut self, i: usize) {
        let me = self.observer_keys[i].public();
        self.observer_hub.kill(&me);
        self.generator_hub.kill(&me);
        self.observers[i] = None;
    }

    pub(crate) fn stop_generator(&mut self, i: usize) {
        let me = self.generator_keys[i].public();
        self.node_hub.kill(&me);
        self.generator_hub.kill(&me);
        self.generators[i] = None;
    }

    pub(crate) fn stop_node(&mut self, i: usize) {
        let me = self.node_keys[i].public();
        self.node_hub.kill(&me);
        self.nodes[i] = None;
    }

    pub(crate) fn generator(&self, i: usize) -> &GeneratorReplica<MemDB> {
        self.generators[i].as_ref().unwrap()
    }

    pub(crate) fn observer_height(&self, i: usize) -> u32 {
        self.observer_stores[i].height()
    }

    /// Heights of every store of the running roles.
    pub(crate) fn running_heights(&self) -> Vec<u32> {
        let observers = self
            .observers
            .iter()
            .zip(&self.observer_stores)
            .filter(|(replica, _)| replica.is_some())
            .map(|(_, store)| store.height());
        let generators = self
            .generators
            .iter()
            .zip(&self.generator_stores)
            .filter(|(replica, _)| replica.is_some())
            .map(|(_, store)| store.height());
        let nodes = self
            .nodes
            .iter()
            .zip(&self.node_stores)
            .filter(|(replica, _)| replica.is_some())
            .map(|(_, store)| store.height());
        observers.chain(generators).chain(nodes).collect()
    }

    pub(crate) fn all_stores(&self) -> impl Iterator<Item = &ChainStore<MemDB>> {
        self.observer_stores
            .iter()
            .chain(&self.generator_stores)
            .chain(&self.node_stores)
    }

    /// Check that every store agrees on the hash of every height both have.
    pub(crate) fn assert_same_chain(&self) {
        let stores: Vec<&ChainStore<MemDB>> = self.all_stores().collect();
        let max = stores.iter().map(|store| store.height()).max().unwrap_or(0);
        for height in 0..=max {
            let hashes: Vec<Hash256> = stores
                .iter()
                .filter_map(|store| store.hash(height).unwrap())
                .collect();
            assert!(
                hashes.windows(2).all(|pair| pair[0] == pair[1]),
                "stores disagree at height {}",
                height
            );
        }
    }

    pub(crate) fn halted(&self) -> bool {
        self.observers.iter().flatten().any(|replica| replica.is_halted())
            || self.generators.iter().flatten().any(|replica| replica.is_halted())
            || self.nodes.iter().flatten().any(|replica| replica.is_halted())
    }
}

/// Poll `condition` every 100ms until it holds or `timeout` elapses. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    condition()
}

fn commit_block_handler(
    me: PublicKey,
    recorder: &Recorder,
) -> impl Fn(&pof_rs::events::CommitBlockEvent) + Send + 'static {
    let commits = recorder.commits.clone();
    move |event| {
        log::debug!(
            "{}: Committed Block, height: {}, block hash: {}, transactions: {}",
            first_seven_base64_chars(me.bytes()),
            event.height,
            first_seven_base64_chars(event.block.bytes()),
            event.transactions
        );
        commits.lock().unwrap().push((me, event.height, event.block));
    }
}

fn generator_timeout_handler(
    recorder: &Recorder,
) -> impl Fn(&pof_rs::events::GeneratorTimeoutEvent) + Send + 'static {
    let timeouts = recorder.generator_timeouts.clone();
    move |event| {
        timeouts
            .lock()
            .unwrap()
            .push((event.target_height, event.generator))
    }
}

fn fork_detected_handler(
    me: PublicKey,
    recorder: &Recorder,
) -> impl Fn(&pof_rs::events::ForkDetectedEvent) + Send + 'static {
    let forks = recorder.forks.clone();
    move |event| forks.lock().unwrap().push((me, event.peer, event.height))
}

fn request_blocks_handler(
    me: PublicKey,
    recorder: &Recorder,
) -> impl Fn(&pof_rs::events::RequestBlocksEvent) + Send + 'static {
    let requests = recorder.requests.clone();
    move |event| requests.lock().unwrap().push((me, event.height, event.count))
}

fn serve_blocks_handler(recorder: &Recorder) -> impl Fn(&pof_rs::events::ServeBlocksEvent) + Send + 'static {
    let serves = recorder.serves.clone();
    move |event| {
        serves
            .lock()
            .unwrap()
            .push((event.height, event.count, event.from_batch_cache))
    }
}

fn expire_transactions_handler(
    recorder: &Recorder,
) -> impl Fn(&pof_rs::events::ExpireTransactionsEvent) + Send + 'static {
    let expirations = recorder.expirations.clone();
    move |event| {
        expirations
            .lock()
            .unwrap()
            .extend(event.transactions.iter().copied())
    }
}
