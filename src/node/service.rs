/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [`NodeService`]: everything a full node or a generator runs over the node gossip mesh.
//!
//! ## Threads
//!
//! 1. The **poller** routes transaction gossip to the admission pipeline, sync requests to the sync
//!    server, and statuses and blocks to the sync client.
//! 2. The [admission pipeline](crate::txpool::admission) (tx-wait workers and the broadcaster).
//! 3. The [sync server](crate::sync::server) and the [sync client](crate::sync::client).
//! 4. The **cleaner**, which drops expired transactions from the pool every [`CLEAN_INTERVAL`].

use std::{
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    consensus::errors::Halt,
    context::committer::Committer,
    events::{Event, ExpireTransactionsEvent},
    networking::{
        codec::Packet,
        mesh::{start_polling, Mesh, Routes},
    },
    store::pluggables::KVStore,
    sync::{
        client::SyncClient,
        messages::{BlockMessage, RequestMessage, StatusMessage},
        server::{start_serving, SyncServer},
    },
    txpool::{
        admission::{Submission, TransactionAdmission},
        messages::TransactionMessage,
        pool::{PoolError, TransactionPool},
    },
    types::{
        data_types::{Hash256, Signature},
        transaction::{current_slot, Transaction},
    },
};

/// How often expired transactions are dropped from the pool.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct NodeService<K: KVStore> {
    pool: Arc<TransactionPool>,
    admission: Option<TransactionAdmission<K>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    sync_client: Option<JoinHandle<()>>,
    sync_client_shutdown: Sender<()>,
    sync_server: Option<JoinHandle<()>>,
    sync_server_shutdown: Sender<()>,
    cleaner: Option<JoinHandle<()>>,
    cleaner_shutdown: Sender<()>,
}

impl<K: KVStore> NodeService<K> {
    pub(crate) fn start<M: Mesh>(
        committer: Committer<K>,
        pool: Arc<TransactionPool>,
        mesh: M,
        tx_wait_workers: usize,
        status_interval: Duration,
        halt: Halt,
        event_publisher: Option<Sender<Event>>,
    ) -> NodeService<K> {
        let mut routes = Routes::new();
        let transactions = routes.route(&[TransactionMessage::type_id()]);
        let sync_requests = routes.route(&[RequestMessage::type_id()]);
        let sync_messages = routes.route(&[StatusMessage::type_id(), BlockMessage::type_id()]);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(
            mesh.clone(),
            routes,
            event_publisher.clone(),
            poller_shutdown_receiver,
        );

        let admission = TransactionAdmission::start(
            committer.clone(),
            pool.clone(),
            mesh.clone(),
            transactions,
            tx_wait_workers,
            event_publisher.clone(),
        );

        let (sync_server_shutdown, sync_server_shutdown_receiver) = mpsc::channel();
        let sync_server = start_serving(
            Arc::new(SyncServer::new(committer.store().clone())),
            mesh.clone(),
            sync_requests,
            event_publisher.clone(),
            sync_server_shutdown_receiver,
        );

        let (sync_client_shutdown, sync_client_shutdown_receiver) = mpsc::channel();
        let sync_client = SyncClient::new(
            committer,
            mesh,
            Some(pool.clone()),
            status_interval,
            halt,
            event_publisher.clone(),
        )
        .start(sync_messages, sync_client_shutdown_receiver);

        let (cleaner_shutdown, cleaner_shutdown_receiver) = mpsc::channel();
        let cleaner = start_cleaning(pool.clone(), event_publisher, cleaner_shutdown_receiver);

        NodeService {
            pool,
            admission: Some(admission),
            poller: Some(poller),
            poller_shutdown,
            sync_client: Some(sync_client),
            sync_client_shutdown,
            sync_server: Some(sync_server),
            sync_server_shutdown,
            cleaner: Some(cleaner),
            cleaner_shutdown,
        }
    }

    pub(crate) fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    /// Run every admission check on a locally submitted transaction and push it into the pool.
    pub(crate) fn admit(&self, transaction: Transaction, signature: Signature) -> Result<Hash256, PoolError> {
        let admission = self
            .admission
            .as_ref()
            .ok_or(PoolError::TransactionPoolOverflowed)?;
        admission.admitter().admit(Submission {
            transaction,
            signature,
            origin: None,
        })
    }
}

impl<K: KVStore> Drop for NodeService<K> {
    fn drop(&mut self) {
        // Consumers stop before the poller that feeds them.
        self.cleaner_shutdown.send(()).unwrap();
        self.cleaner.take().unwrap().join().unwrap();

        self.sync_client_shutdown.send(()).unwrap();
        self.sync_client.take().unwrap().join().unwrap();

        self.sync_server_shutdown.send(()).unwrap();
        self.sync_server.take().unwrap().join().unwrap();

        drop(self.admission.take());

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();
    }
}

fn start_cleaning(
    pool: Arc<TransactionPool>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_clean = Instant::now();
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Pool cleaner thread disconnected from main thread")
                }
            }
            thread::sleep(Duration::from_millis(50));
            if last_clean.elapsed() < CLEAN_INTERVAL {
                continue;
            }
            last_clean = Instant::now();

            let expired = pool.clean(current_slot());
            if !expired.is_empty() {
                log::debug!("ExpireTransactions, {}", expired.len());
                Event::publish(
                    &event_publisher,
                    Event::ExpireTransactions(ExpireTransactionsEvent {
                        timestamp: SystemTime::now(),
                        transactions: expired.iter().map(Transaction::hash).collect(),
                    }),
                );
            }
        }
    })
}
