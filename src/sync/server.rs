/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The serving side of catch-up: answers [`RequestMessage`]s with committed blocks.
//!
//! Responses are encoded once and cached:
//! - the **batch cache** holds responses to aligned requests (`height % 10 == 0` and `count == 10`),
//!   keyed by their start height, which is what lagging peers ask for most of the time;
//! - the **single cache** holds one-block responses, keyed by height.
//!
//! Committed blocks never change, so cache entries never go stale. Both caches are bounded and evict
//! their oldest entry first.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use crate::{
    events::{Event, ServeBlocksEvent},
    networking::{
        codec::{encode_packet, Envelope},
        mesh::Mesh,
    },
    store::{
        chain_store::ChainStore,
        pluggables::{KVStore, StoreError},
    },
    types::data_types::PublicKey,
};

use super::messages::{BlockMessage, RequestMessage, MAX_BLOCKS_PER_REQUEST};

const BATCH_CACHE_CAPACITY: usize = 64;
const SINGLE_CACHE_CAPACITY: usize = 256;

/// A response, ready to send.
pub struct Served {
    pub packet: Arc<Vec<u8>>,
    pub height: u32,
    pub count: u32,
    pub from_batch_cache: bool,
    pub from_single_cache: bool,
}

pub struct SyncServer<K: KVStore> {
    store: ChainStore<K>,
    batches: Mutex<PacketCache>,
    singles: Mutex<PacketCache>,
}

impl<K: KVStore> SyncServer<K> {
    pub fn new(store: ChainStore<K>) -> SyncServer<K> {
        SyncServer {
            store,
            batches: Mutex::new(PacketCache::new(BATCH_CACHE_CAPACITY)),
            singles: Mutex::new(PacketCache::new(SINGLE_CACHE_CAPACITY)),
        }
    }

    /// Build the response to `request`, or `None` if the store has no block at `request.height`.
    ///
    /// At most [`MAX_BLOCKS_PER_REQUEST`] blocks are returned, and never past the store's tip.
    pub fn serve(&self, request: &RequestMessage) -> Result<Option<Served>, StoreError> {
        let height = self.store.height();
        if request.height == 0 || request.height > height || request.count == 0 {
            return Ok(None);
        }

        let is_batch = request.height % MAX_BLOCKS_PER_REQUEST == 0
            && request.count == MAX_BLOCKS_PER_REQUEST
            && request.height + MAX_BLOCKS_PER_REQUEST - 1 <= height;
        if is_batch {
            if let Some(packet) = self.batches.lock().unwrap().get(request.height) {
                return Ok(Some(Served {
                    packet,
                    height: request.height,
                    count: MAX_BLOCKS_PER_REQUEST,
                    from_batch_cache: true,
                    from_single_cache: false,
                }));
            }
        } else if request.count == 1 {
            if let Some(packet) = self.singles.lock().unwrap().get(request.height) {
                return Ok(Some(Served {
                    packet,
                    height: request.height,
                    count: 1,
                    from_batch_cache: false,
                    from_single_cache: true,
                }));
            }
        }

        let last = height.min(request.height + request.count.min(MAX_BLOCKS_PER_REQUEST) - 1);
        let mut blocks = Vec::with_capacity((last - request.height + 1) as usize);
        for h in request.height..=last {
            match self.store.block(h)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        if blocks.is_empty() {
            return Ok(None);
        }

        let count = blocks.len() as u32;
        let packet = Arc::new(encode_packet(&BlockMessage { blocks }));
        if is_batch && count == MAX_BLOCKS_PER_REQUEST {
            self.batches
                .lock()
                .unwrap()
                .insert(request.height, packet.clone());
        } else if count == 1 {
            self.singles
                .lock()
                .unwrap()
                .insert(request.height, packet.clone());
        }
        Ok(Some(Served {
            packet,
            height: request.height,
            count,
            from_batch_cache: false,
            from_single_cache: false,
        }))
    }
}

struct PacketCache {
    entries: HashMap<u32, Arc<Vec<u8>>>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl PacketCache {
    fn new(capacity: usize) -> PacketCache {
        PacketCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, height: u32) -> Option<Arc<Vec<u8>>> {
        self.entries.get(&height).cloned()
    }

    fn insert(&mut self, height: u32, packet: Arc<Vec<u8>>) {
        if self.entries.insert(height, packet).is_none() {
            self.order.push_back(height);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Spawn a thread that answers every [`RequestMessage`] arriving on `requests` over `mesh`.
pub(crate) fn start_serving<K: KVStore, M: Mesh>(
    server: Arc<SyncServer<K>>,
    mut mesh: M,
    requests: Receiver<(PublicKey, Envelope)>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Sync server thread disconnected from main thread")
            }
        }

        let (origin, envelope) = match requests.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        let request = match envelope.parse::<RequestMessage>() {
            Ok(request) => request,
            Err(err) => {
                log::debug!("InvalidRequest, {}, {}", origin, err);
                continue;
            }
        };
        match server.serve(&request) {
            Ok(Some(served)) => {
                mesh.send_to(&origin, &served.packet);
                Event::publish(
                    &event_publisher,
                    Event::ServeBlocks(ServeBlocksEvent {
                        timestamp: SystemTime::now(),
                        peer: origin,
                        height: served.height,
                        count: served.count,
                        from_batch_cache: served.from_batch_cache,
                    }),
                );
            }
            Ok(None) => (),
            Err(err) => log::warn!("ServeBlocks, {}, {}", origin, err),
        }
    })
}
