/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and initialize the storage of the three roles of a pof_rs network.
//!
//! A pof_rs network replicates a chain between three kinds of processes:
//! - **Observers** agree on every block. A fixed set of observers, identified by their public keys, run
//!   the vote rounds and sign blocks.
//! - **Generators** produce blocks. The set of generators is seeded in the genesis state, and the rank
//!   table decides whose turn it is.
//! - **Nodes** keep up with the chain and gossip transactions to the generators.
//!
//! The key components of this module are:
//! - The builder-pattern interfaces to describe each role ([`ObserverSpec`],
//!   [`GeneratorSpec`], [`NodeSpec`]),
//! - The `start` functions, which return a handle that keeps the role alive until it is dropped,
//! - The function to [initialize](initialize) a chain store with its genesis.
//!
//! ## Starting an observer
//!
//! ```ignore
//! let observer =
//!     ObserverSpec::builder()
//!     .app(app)
//!     .store(store)
//!     .observer_mesh(observer_mesh)
//!     .generator_mesh(generator_service)
//!     .configuration(configuration)
//!     .on_commit_block(commit_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations required to run a role:
//! - `.app(...)`
//! - `.store(...)`
//! - the role's meshes
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for the [events](crate::events)
//! the role emits, e.g., `.on_commit_block(...)`.
//!
//! ## Fatal errors
//!
//! A role that detects a fork, or whose state can no longer be trusted, stops appending blocks and sends
//! the cause to the receiver returned by its handle's `fatal_errors` method. Deciding whether to
//! restart or abort the process is left to the library user.

use std::{
    collections::BTreeSet,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    config::ProtocolParams,
    consensus::{
        errors::{ConsensusError, Halt},
        generator::Generator,
        messages::{
            BlockGenMessage, BlockObSignMessage, BlockReqMessage, BlockRevokeMessage, BlockVoteMessage,
            RoundVoteAckMessage, RoundVoteMessage,
        },
        observer::Observer,
        pof::PofConsensus,
        rank_table::RankTable,
    },
    context::{
        application::Application, committer::Committer, errors::ChainError, Context,
    },
    event_bus::*,
    events::*,
    networking::{
        codec::Packet,
        generator_service::GeneratorGate,
        mesh::{start_polling, Mesh, Routes},
    },
    node::service::NodeService,
    store::{
        chain_store::{start_shrinking, ChainStore},
        pluggables::{KVStore, StoreError},
    },
    sync::{
        client::SyncClient,
        messages::{BlockMessage, RequestMessage, StatusMessage},
        server::{start_serving, SyncServer},
    },
    txpool::{
        admission::tx_wait_worker_count,
        pool::{PoolError, TransactionPool},
    },
    types::{
        block::Header,
        crypto_primitives::{keccak256_concat, Keypair},
        data_types::{Address, Hash256, PublicKey, Signature},
        transaction::Transaction,
    },
};

/// How often used time-slots that can no longer be replayed are deleted.
pub const SHRINK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(2);

fn default_tx_wait_workers() -> usize {
    tx_wait_worker_count(thread::available_parallelism().map_or(1, |cpus| cpus.get()))
}

/* ↓↓↓ Genesis ↓↓↓ */

/// The initial state of a chain.
#[derive(Clone, Debug, TypedBuilder)]
pub struct GenesisConfig {
    #[builder(setter(doc = "Set the addresses of the generators, which seed the rank table. Required."))]
    pub generators: Vec<Address>,
    #[builder(default, setter(doc = "Set the addresses allowed to send admin transactions. Defaults to none."))]
    pub admins: Vec<Address>,
    #[builder(default, setter(doc = "Set the genesis timestamp in Unix nanoseconds. Defaults to 0."))]
    pub timestamp: u64,
}

/// Write the genesis block into `store`: the application's genesis state, the admins, and the rank
/// table seeded with the generators. Returns the genesis hash.
///
/// Calling this on a store that already holds the same genesis is a no-op. A store that holds a
/// different genesis fails with [`StoreError::GenesisMismatch`].
pub fn initialize<K: KVStore>(
    store: &ChainStore<K>,
    app: &dyn Application,
    params: &ProtocolParams,
    genesis: &GenesisConfig,
) -> Result<Hash256, ChainError> {
    let mut header = Header {
        version: params.version,
        height: 0,
        prev_hash: Hash256::zero(),
        level_root_hash: Hash256::zero(),
        context_hash: Hash256::zero(),
        timestamp: genesis.timestamp,
        generator: Address::zero(),
        timeout_count: 0,
        consensus_data: Vec::new(),
        receipt_hash: Hash256::zero(),
    };
    let mut ctx = Context::genesis(Arc::new(store.clone()), header.clone());
    app.init_genesis(&mut ctx)?;
    ctx.set_admins(&genesis.admins);
    RankTable::new(genesis.generators.iter().copied()).save(&mut ctx);

    header.context_hash = ctx.hash();
    let genesis_hash = keccak256_concat(&[&params.chain_id.to_le_bytes(), header.context_hash.bytes()]);
    store.store_genesis(&genesis_hash, &header, &ctx.delta())?;
    log::info!("Genesis, {}, {} generators", genesis_hash, genesis.generators.len());
    Ok(genesis_hash)
}

/// Build the committer every role executes blocks with, and re-execute blocks left in the pile by a
/// crash.
fn open_committer<K: KVStore>(
    store: ChainStore<K>,
    app: Arc<dyn Application>,
    observers: &[PublicKey],
    params: ProtocolParams,
) -> Result<Committer<K>, ChainError> {
    if !store.is_initialized() {
        return Err(StoreError::NotInitialized.into());
    }
    let consensus = PofConsensus::new(observers.iter().copied(), params.max_blocks_per_generator);
    let committer = Committer::new(store, app, Arc::new(consensus), params);
    let replayed = committer.replay_pile()?;
    if replayed > 0 {
        log::info!("ReplayPile, {}", replayed);
    }
    Ok(committer)
}

/// The event bus of a role, if any handler was registered.
struct EventBusHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

impl EventBusHandle {
    fn start(log_events: bool, user: UserHandlers) -> (EventBusHandle, Option<Sender<Event>>) {
        let event_handlers = EventHandlers::new(log_events, user);
        if event_handlers.is_empty() {
            return (
                EventBusHandle {
                    thread: None,
                    shutdown: None,
                },
                None,
            );
        }
        let (event_publisher, event_subscriber) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
        (
            EventBusHandle {
                thread: Some(thread),
                shutdown: Some(shutdown),
            },
            Some(event_publisher),
        )
    }
}

impl Drop for EventBusHandle {
    fn drop(&mut self) {
        self.shutdown.iter().for_each(|shutdown| shutdown.send(()).unwrap());
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// A thread paired with its shutdown channel. Dropping it stops and joins the thread.
struct Worker {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Worker {
    fn start(spawn: impl FnOnce(Receiver<()>) -> JoinHandle<()>) -> Worker {
        let (shutdown, shutdown_receiver) = mpsc::channel();
        Worker {
            thread: Some(spawn(shutdown_receiver)),
            shutdown,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.send(()).unwrap();
        self.thread.take().unwrap().join().unwrap();
    }
}

/* ↓↓↓ Observer ↓↓↓ */

/// Stores the user-defined parameters required to start an observer.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [ObserverConfiguration].

    Required:
    - `.keypair(...)`
    - `.params(...)`
    - `.observers(...)`

    Optional:
    - `.status_interval(...)`
    - `.log_events(...)`
"))]
pub struct ObserverConfiguration {
    #[builder(setter(doc = "Set the observer's keypair, used to sign votes and blocks. Required."))]
    pub keypair: Keypair,
    #[builder(setter(doc = "Set the protocol parameters of the chain. Required."))]
    pub params: ProtocolParams,
    #[builder(setter(doc = "Set the public keys of every observer, this one included. Required."))]
    pub observers: Vec<PublicKey>,
    #[builder(default = DEFAULT_STATUS_INTERVAL, setter(doc = "Set how often the local tip is announced when nothing is committed. Defaults to 2s."))]
    pub status_interval: Duration,
    #[builder(default = false, setter(doc = "Enable logging of every event? Defaults to false."))]
    pub log_events: bool,
}

#[derive(TypedBuilder)]
pub struct ObserverSpec<K: KVStore, O: Mesh, G: GeneratorGate> {
    // Required parameters
    #[builder(setter(doc = "Set the application that executes transactions. Required."))]
    app: Arc<dyn Application>,
    #[builder(setter(doc = "Set the chain store, which must already hold the genesis. Required."))]
    store: ChainStore<K>,
    #[builder(setter(doc = "Set the mesh to the other observers. Required."))]
    observer_mesh: O,
    #[builder(setter(doc = "Set the mesh generators connect to. Required."))]
    generator_mesh: G,
    #[builder(setter(doc = "Set the [configuration](ObserverConfiguration). Required."))]
    configuration: ObserverConfiguration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveBlockGenEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveBlockGenEvent>),
    doc = "Register a handler closure to be invoked after a generated block is received and executed. Optional."))]
    on_receive_block_gen: Option<HandlerPtr<ReceiveBlockGenEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundVoteEvent>),
    doc = "Register a handler closure to be invoked after the observer casts a round vote. Optional."))]
    on_round_vote: Option<HandlerPtr<RoundVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundVoteAckEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundVoteAckEvent>),
    doc = "Register a handler closure to be invoked after the observer acks a round vote. Optional."))]
    on_round_vote_ack: Option<HandlerPtr<RoundVoteAckEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BlockVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BlockVoteEvent>),
    doc = "Register a handler closure to be invoked after the observer signs a block. Optional."))]
    on_block_vote: Option<HandlerPtr<BlockVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&GeneratorTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GeneratorTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a generator times out. Optional."))]
    on_generator_timeout: Option<HandlerPtr<GeneratorTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestBlocksEvent>),
    doc = "Register a handler closure to be invoked after missing blocks are requested from a peer. Optional."))]
    on_request_blocks: Option<HandlerPtr<RequestBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ServeBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ServeBlocksEvent>),
    doc = "Register a handler closure to be invoked after blocks are served to a peer. Optional."))]
    on_serve_blocks: Option<HandlerPtr<ServeBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ForkDetectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ForkDetectedEvent>),
    doc = "Register a handler closure to be invoked after a peer on a fork is detected. Optional."))]
    on_fork_detected: Option<HandlerPtr<ForkDetectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemovePeerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemovePeerEvent>),
    doc = "Register a handler closure to be invoked after a peer is removed. Optional."))]
    on_remove_peer: Option<HandlerPtr<RemovePeerEvent>>,
}

impl<K: KVStore, O: Mesh, G: GeneratorGate> ObserverSpec<K, O, G> {
    /// Starts all threads and channels associated with running an observer, and returns the handle to
    /// them.
    pub fn start(self) -> Result<ObserverReplica<K>, ChainError> {
        let configuration = self.configuration;
        let committer = open_committer(
            self.store.clone(),
            self.app,
            &configuration.observers,
            configuration.params.clone(),
        )?;

        let (event_bus, event_publisher) = EventBusHandle::start(
            configuration.log_events,
            UserHandlers {
                on_commit_block: self.on_commit_block,
                on_receive_block_gen: self.on_receive_block_gen,
                on_round_vote: self.on_round_vote,
                on_round_vote_ack: self.on_round_vote_ack,
                on_block_vote: self.on_block_vote,
                on_generator_timeout: self.on_generator_timeout,
                on_request_blocks: self.on_request_blocks,
                on_serve_blocks: self.on_serve_blocks,
                on_fork_detected: self.on_fork_detected,
                on_remove_peer: self.on_remove_peer,
                ..Default::default()
            },
        );
        let (fatal_sender, fatal_errors) = mpsc::channel();
        let halt = Halt::new(fatal_sender);

        let mut observer_routes = Routes::new();
        let observer_messages = observer_routes.route(&[
            RoundVoteMessage::type_id(),
            RoundVoteAckMessage::type_id(),
            BlockVoteMessage::type_id(),
            BlockGenMessage::type_id(),
            BlockReqMessage::type_id(),
            BlockRevokeMessage::type_id(),
        ]);
        let sync_messages = observer_routes.route(&[StatusMessage::type_id(), BlockMessage::type_id()]);
        let observer_requests = observer_routes.route(&[RequestMessage::type_id()]);

        let mut generator_routes = Routes::new();
        let generator_messages =
            generator_routes.route(&[BlockGenMessage::type_id(), StatusMessage::type_id()]);
        let generator_requests = generator_routes.route(&[RequestMessage::type_id()]);

        let observer_poller = Worker::start(|shutdown| {
            start_polling(self.observer_mesh.clone(), observer_routes, event_publisher.clone(), shutdown)
        });
        let generator_poller = Worker::start(|shutdown| {
            start_polling(self.generator_mesh.clone(), generator_routes, event_publisher.clone(), shutdown)
        });

        let sync_server = Arc::new(SyncServer::new(self.store.clone()));
        let observer_sync_server = Worker::start(|shutdown| {
            start_serving(
                sync_server.clone(),
                self.observer_mesh.clone(),
                observer_requests,
                event_publisher.clone(),
                shutdown,
            )
        });
        let generator_sync_server = Worker::start(|shutdown| {
            start_serving(
                sync_server,
                self.generator_mesh.clone(),
                generator_requests,
                event_publisher.clone(),
                shutdown,
            )
        });
        let sync_client = Worker::start(|shutdown| {
            SyncClient::new(
                committer.clone(),
                self.observer_mesh.clone(),
                None,
                configuration.status_interval,
                halt.clone(),
                event_publisher.clone(),
            )
            .start(sync_messages, shutdown)
        });
        let shrinker = Worker::start(|shutdown| start_shrinking(self.store.clone(), SHRINK_INTERVAL, shutdown));

        let observers: BTreeSet<PublicKey> = configuration.observers.iter().copied().collect();
        let observer = Worker::start(|shutdown| {
            Observer::new(
                configuration.keypair,
                observers,
                committer,
                self.observer_mesh,
                self.generator_mesh,
                configuration.status_interval,
                halt.clone(),
                event_publisher,
            )
            .start(observer_messages, generator_messages, shutdown)
        });

        Ok(ObserverReplica {
            store: self.store,
            halt,
            fatal_errors,
            event_bus,
            threads: vec![
                observer,
                sync_client,
                observer_sync_server,
                generator_sync_server,
                shrinker,
                observer_poller,
                generator_poller,
            ],
        })
    }
}

/// A handle to the background threads of an observer. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct ObserverReplica<K: KVStore> {
    store: ChainStore<K>,
    halt: Halt,
    fatal_errors: Receiver<ConsensusError>,
    // Dropped in declaration order: the event bus first, then the threads in the order listed, pollers
    // last.
    event_bus: EventBusHandle,
    threads: Vec<Worker>,
}

impl<K: KVStore> ObserverReplica<K> {
    pub fn store(&self) -> &ChainStore<K> {
        &self.store
    }

    /// Errors that made the observer stop appending blocks.
    pub fn fatal_errors(&self) -> &Receiver<ConsensusError> {
        &self.fatal_errors
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }
}

/* ↓↓↓ Generator ↓↓↓ */

/// Stores the user-defined parameters required to start a generator.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [GeneratorConfiguration].

    Required:
    - `.keypair(...)`
    - `.params(...)`
    - `.observers(...)`

    Optional:
    - `.tx_wait_workers(...)`
    - `.status_interval(...)`
    - `.log_events(...)`
"))]
pub struct GeneratorConfiguration {
    #[builder(setter(doc = "Set the generator's keypair, used to sign produced blocks. Its address must be in the rank table. Required."))]
    pub keypair: Keypair,
    #[builder(setter(doc = "Set the protocol parameters of the chain. Required."))]
    pub params: ProtocolParams,
    #[builder(setter(doc = "Set the public keys of every observer. Required."))]
    pub observers: Vec<PublicKey>,
    #[builder(default = default_tx_wait_workers(), setter(doc = "Set the number of transaction admission workers. Defaults to `ceil(cpus / 2) + 1`, capped at `cpus - 1`."))]
    pub tx_wait_workers: usize,
    #[builder(default = DEFAULT_STATUS_INTERVAL, setter(doc = "Set how often the local tip is announced when nothing is committed. Defaults to 2s."))]
    pub status_interval: Duration,
    #[builder(default = false, setter(doc = "Enable logging of every event? Defaults to false."))]
    pub log_events: bool,
}

#[derive(TypedBuilder)]
pub struct GeneratorSpec<K: KVStore, N: Mesh, L: Mesh> {
    // Required parameters
    #[builder(setter(doc = "Set the application that executes transactions. Required."))]
    app: Arc<dyn Application>,
    #[builder(setter(doc = "Set the chain store, which must already hold the genesis. Required."))]
    store: ChainStore<K>,
    #[builder(setter(doc = "Set the gossip mesh to full nodes. Required."))]
    node_mesh: N,
    #[builder(setter(doc = "Set the link to the observers' generator meshes. Required."))]
    observer_link: L,
    #[builder(setter(doc = "Set the [configuration](GeneratorConfiguration). Required."))]
    configuration: GeneratorConfiguration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProduceBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProduceBlockEvent>),
    doc = "Register a handler closure to be invoked after the generator produces a block. Optional."))]
    on_produce_block: Option<HandlerPtr<ProduceBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DeadLetterEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeadLetterEvent>),
    doc = "Register a handler closure to be invoked with the transactions that failed during a turn. Optional."))]
    on_dead_letter: Option<HandlerPtr<DeadLetterEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExpireTransactionsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExpireTransactionsEvent>),
    doc = "Register a handler closure to be invoked after expired transactions are dropped from the pool. Optional."))]
    on_expire_transactions: Option<HandlerPtr<ExpireTransactionsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestBlocksEvent>),
    doc = "Register a handler closure to be invoked after missing blocks are requested from a peer. Optional."))]
    on_request_blocks: Option<HandlerPtr<RequestBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ServeBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ServeBlocksEvent>),
    doc = "Register a handler closure to be invoked after blocks are served to a peer. Optional."))]
    on_serve_blocks: Option<HandlerPtr<ServeBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ForkDetectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ForkDetectedEvent>),
    doc = "Register a handler closure to be invoked after a peer on a fork is detected. Optional."))]
    on_fork_detected: Option<HandlerPtr<ForkDetectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemovePeerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemovePeerEvent>),
    doc = "Register a handler closure to be invoked after a peer is removed. Optional."))]
    on_remove_peer: Option<HandlerPtr<RemovePeerEvent>>,
}

impl<K: KVStore, N: Mesh, L: Mesh> GeneratorSpec<K, N, L> {
    /// Starts all threads and channels associated with running a generator, and returns the handle to
    /// them.
    pub fn start(self) -> Result<GeneratorReplica<K>, ChainError> {
        let configuration = self.configuration;
        let committer = open_committer(
            self.store.clone(),
            self.app,
            &configuration.observers,
            configuration.params.clone(),
        )?;

        let (event_bus, event_publisher) = EventBusHandle::start(
            configuration.log_events,
            UserHandlers {
                on_commit_block: self.on_commit_block,
                on_produce_block: self.on_produce_block,
                on_dead_letter: self.on_dead_letter,
                on_expire_transactions: self.on_expire_transactions,
                on_request_blocks: self.on_request_blocks,
                on_serve_blocks: self.on_serve_blocks,
                on_fork_detected: self.on_fork_detected,
                on_remove_peer: self.on_remove_peer,
                ..Default::default()
            },
        );
        let (fatal_sender, fatal_errors) = mpsc::channel();
        let halt = Halt::new(fatal_sender);
        let pool = Arc::new(TransactionPool::new(configuration.params.pool_capacity));

        let node_service = NodeService::start(
            committer.clone(),
            pool.clone(),
            self.node_mesh,
            configuration.tx_wait_workers,
            configuration.status_interval,
            halt.clone(),
            event_publisher.clone(),
        );

        let mut link_routes = Routes::new();
        let turn_messages = link_routes.route(&[
            BlockReqMessage::type_id(),
            BlockRevokeMessage::type_id(),
            BlockObSignMessage::type_id(),
            BlockGenMessage::type_id(),
        ]);
        let sync_messages = link_routes.route(&[StatusMessage::type_id(), BlockMessage::type_id()]);
        let link_poller = Worker::start(|shutdown| {
            start_polling(self.observer_link.clone(), link_routes, event_publisher.clone(), shutdown)
        });

        let sync_client = Worker::start(|shutdown| {
            SyncClient::new(
                committer.clone(),
                self.observer_link.clone(),
                Some(pool.clone()),
                configuration.status_interval,
                halt.clone(),
                event_publisher.clone(),
            )
            .start(sync_messages, shutdown)
        });
        let shrinker = Worker::start(|shutdown| start_shrinking(self.store.clone(), SHRINK_INTERVAL, shutdown));
        let generator = Worker::start(|shutdown| {
            Generator::new(
                configuration.keypair,
                committer,
                pool,
                self.observer_link,
                halt.clone(),
                event_publisher,
            )
            .start(turn_messages, shutdown)
        });

        Ok(GeneratorReplica {
            store: self.store,
            halt,
            fatal_errors,
            event_bus,
            threads: vec![generator, sync_client, shrinker, link_poller],
            node_service,
        })
    }
}

/// A handle to the background threads of a generator. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct GeneratorReplica<K: KVStore> {
    store: ChainStore<K>,
    halt: Halt,
    fatal_errors: Receiver<ConsensusError>,
    event_bus: EventBusHandle,
    threads: Vec<Worker>,
    node_service: NodeService<K>,
}

impl<K: KVStore> GeneratorReplica<K> {
    pub fn store(&self) -> &ChainStore<K> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        self.node_service.pool()
    }

    /// Admit a locally signed transaction into the pool. It is gossiped to the node mesh on success.
    pub fn submit_transaction(&self, transaction: Transaction, signature: Signature) -> Result<Hash256, PoolError> {
        self.node_service.admit(transaction, signature)
    }

    pub fn fatal_errors(&self) -> &Receiver<ConsensusError> {
        &self.fatal_errors
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }
}

/* ↓↓↓ Node ↓↓↓ */

/// Stores the user-defined parameters required to start a full node.
#[derive(TypedBuilder)]
pub struct NodeConfiguration {
    #[builder(setter(doc = "Set the protocol parameters of the chain. Required."))]
    pub params: ProtocolParams,
    #[builder(setter(doc = "Set the public keys of every observer, to validate block signatures. Required."))]
    pub observers: Vec<PublicKey>,
    #[builder(default = default_tx_wait_workers(), setter(doc = "Set the number of transaction admission workers. Defaults to `ceil(cpus / 2) + 1`, capped at `cpus - 1`."))]
    pub tx_wait_workers: usize,
    #[builder(default = DEFAULT_STATUS_INTERVAL, setter(doc = "Set how often the local tip is announced when nothing is committed. Defaults to 2s."))]
    pub status_interval: Duration,
    #[builder(default = false, setter(doc = "Enable logging of every event? Defaults to false."))]
    pub log_events: bool,
}

#[derive(TypedBuilder)]
pub struct NodeSpec<K: KVStore, N: Mesh> {
    #[builder(setter(doc = "Set the application that executes transactions. Required."))]
    app: Arc<dyn Application>,
    #[builder(setter(doc = "Set the chain store, which must already hold the genesis. Required."))]
    store: ChainStore<K>,
    #[builder(setter(doc = "Set the gossip mesh. Required."))]
    node_mesh: N,
    #[builder(setter(doc = "Set the [configuration](NodeConfiguration). Required."))]
    configuration: NodeConfiguration,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExpireTransactionsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExpireTransactionsEvent>),
    doc = "Register a handler closure to be invoked after expired transactions are dropped from the pool. Optional."))]
    on_expire_transactions: Option<HandlerPtr<ExpireTransactionsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestBlocksEvent>),
    doc = "Register a handler closure to be invoked after missing blocks are requested from a peer. Optional."))]
    on_request_blocks: Option<HandlerPtr<RequestBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ServeBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ServeBlocksEvent>),
    doc = "Register a handler closure to be invoked after blocks are served to a peer. Optional."))]
    on_serve_blocks: Option<HandlerPtr<ServeBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ForkDetectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ForkDetectedEvent>),
    doc = "Register a handler closure to be invoked after a peer on a fork is detected. Optional."))]
    on_fork_detected: Option<HandlerPtr<ForkDetectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemovePeerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemovePeerEvent>),
    doc = "Register a handler closure to be invoked after a peer is removed. Optional."))]
    on_remove_peer: Option<HandlerPtr<RemovePeerEvent>>,
}

impl<K: KVStore, N: Mesh> NodeSpec<K, N> {
    pub fn start(self) -> Result<NodeReplica<K>, ChainError> {
        let configuration = self.configuration;
        let committer = open_committer(
            self.store.clone(),
            self.app,
            &configuration.observers,
            configuration.params.clone(),
        )?;

        let (event_bus, event_publisher) = EventBusHandle::start(
            configuration.log_events,
            UserHandlers {
                on_commit_block: self.on_commit_block,
                on_expire_transactions: self.on_expire_transactions,
                on_request_blocks: self.on_request_blocks,
                on_serve_blocks: self.on_serve_blocks,
                on_fork_detected: self.on_fork_detected,
                on_remove_peer: self.on_remove_peer,
                ..Default::default()
            },
        );
        let (fatal_sender, fatal_errors) = mpsc::channel();
        let halt = Halt::new(fatal_sender);
        let pool = Arc::new(TransactionPool::new(configuration.params.pool_capacity));

        let node_service = NodeService::start(
            committer,
            pool,
            self.node_mesh,
            configuration.tx_wait_workers,
            configuration.status_interval,
            halt.clone(),
            event_publisher,
        );
        let shrinker = Worker::start(|shutdown| start_shrinking(self.store.clone(), SHRINK_INTERVAL, shutdown));

        Ok(NodeReplica {
            store: self.store,
            halt,
            fatal_errors,
            event_bus,
            shrinker,
            node_service,
        })
    }
}

/// A handle to the background threads of a full node. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct NodeReplica<K: KVStore> {
    store: ChainStore<K>,
    halt: Halt,
    fatal_errors: Receiver<ConsensusError>,
    event_bus: EventBusHandle,
    shrinker: Worker,
    node_service: NodeService<K>,
}

impl<K: KVStore> NodeReplica<K> {
    pub fn store(&self) -> &ChainStore<K> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        self.node_service.pool()
    }

    pub fn submit_transaction(&self, transaction: Transaction, signature: Signature) -> Result<Hash256, PoolError> {
        self.node_service.admit(transaction, signature)
    }

    pub fn fatal_errors(&self) -> &Receiver<ConsensusError> {
        &self.fatal_errors
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }
}
