/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The admission pipeline that feeds the [`TransactionPool`].
//!
//! ## Threads
//!
//! 1. **Tx-wait workers** ([`tx_wait_worker_count`] of them) take submissions from a bounded wait
//!    queue, run [`Admitter::admit`] on each, and hand accepted transactions to the broadcaster.
//! 2. The **broadcaster** moves [`TransactionMessage`]s received from the mesh into the wait queue, and
//!    every [`BROADCAST_INTERVAL`] gossips what the workers accepted in batches of at most
//!    [`MAX_TRANSACTIONS_PER_MESSAGE`]. A batch that came entirely from one peer is not echoed back to
//!    it.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    context::committer::Committer,
    events::Event,
    networking::{
        codec::{encode_packet, Envelope},
        mesh::{penalize, Mesh},
    },
    store::pluggables::KVStore,
    types::{
        data_types::{Hash256, PublicKey, Signature},
        transaction::{current_slot, SignedTransaction, Transaction},
    },
};

use super::{
    messages::{TransactionMessage, MAX_TRANSACTIONS_PER_MESSAGE},
    pool::{check_seq, PoolError, TransactionPool},
};

pub const WAIT_QUEUE_CAPACITY: usize = 1000;
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);
/// How long a worker waits for room in a full pool.
pub const POOL_WAIT: Duration = Duration::from_secs(1);
const OVERSIZED_MESSAGE_POINTS: u32 = 20;

/// `ceil(cpus / 2) + 1` capped at `cpus - 1`, and at least one.
pub fn tx_wait_worker_count(cpus: usize) -> usize {
    ((cpus + 1) / 2 + 1).min(cpus.saturating_sub(1)).max(1)
}

/// A transaction waiting for admission. `origin` is the peer it was gossiped by, if any.
pub struct Submission {
    pub transaction: Transaction,
    pub signature: Signature,
    pub origin: Option<PublicKey>,
}

/// Checks a submission and pushes it into the pool.
#[derive(Clone)]
pub struct Admitter<K: KVStore> {
    committer: Committer<K>,
    pool: Arc<TransactionPool>,
    accepted: Sender<(SignedTransaction, Option<PublicKey>)>,
}

impl<K: KVStore> Admitter<K> {
    /// Run every admission check on `submission` and push it into the pool. On success the transaction
    /// is queued for gossip and its hash is returned.
    pub fn admit(&self, submission: Submission) -> Result<Hash256, PoolError> {
        let Submission {
            transaction,
            signature,
            origin,
        } = submission;
        if !transaction.is_valid_for(self.committer.params().chain_id) {
            return Err(PoolError::InvalidChainID);
        }
        let tx = SignedTransaction::recover(transaction, signature)
            .map_err(|_| PoolError::InvalidSignature)?;
        if self.pool.contains(&tx.hash) {
            return Err(PoolError::ExistTransaction);
        }

        let stored_seq = self
            .committer
            .store()
            .seq(&tx.signer())
            .map_err(|err| PoolError::PreExecution(err.to_string()))?;
        if tx.transaction.is_sequenced() {
            check_seq(tx.transaction.seq, stored_seq)?;
        }
        self.committer
            .pre_execute(&tx)
            .map_err(|err| PoolError::PreExecution(err.to_string()))?;

        let hash = tx.hash;
        self.pool
            .push_waiting(tx.clone(), stored_seq, current_slot(), POOL_WAIT)?;
        let _ = self.accepted.send((tx, origin));
        Ok(hash)
    }
}

pub struct TransactionAdmission<K: KVStore> {
    admitter: Admitter<K>,
    workers: Vec<(JoinHandle<()>, Sender<()>)>,
    broadcaster: Option<JoinHandle<()>>,
    broadcaster_shutdown: Sender<()>,
}

impl<K: KVStore> TransactionAdmission<K> {
    pub(crate) fn start<M: Mesh>(
        committer: Committer<K>,
        pool: Arc<TransactionPool>,
        mesh: M,
        messages: Receiver<(PublicKey, Envelope)>,
        worker_count: usize,
        event_publisher: Option<Sender<Event>>,
    ) -> TransactionAdmission<K> {
        let (accepted, accepted_receiver) = mpsc::channel();
        let admitter = Admitter {
            committer,
            pool,
            accepted,
        };
        let (wait_queue, wait_queue_receiver) = mpsc::sync_channel(WAIT_QUEUE_CAPACITY);
        let wait_queue_receiver = Arc::new(Mutex::new(wait_queue_receiver));

        let workers = (0..worker_count.max(1))
            .map(|_| {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let worker = start_tx_wait_worker(
                    admitter.clone(),
                    wait_queue_receiver.clone(),
                    shutdown_receiver,
                );
                (worker, shutdown)
            })
            .collect();

        let (broadcaster_shutdown, broadcaster_shutdown_receiver) = mpsc::channel();
        let broadcaster = start_broadcaster(
            mesh,
            messages,
            wait_queue,
            accepted_receiver,
            event_publisher,
            broadcaster_shutdown_receiver,
        );

        TransactionAdmission {
            admitter,
            workers,
            broadcaster: Some(broadcaster),
            broadcaster_shutdown,
        }
    }

    pub fn admitter(&self) -> &Admitter<K> {
        &self.admitter
    }
}

impl<K: KVStore> Drop for TransactionAdmission<K> {
    fn drop(&mut self) {
        self.broadcaster_shutdown.send(()).unwrap();
        self.broadcaster.take().unwrap().join().unwrap();
        for (_, shutdown) in &self.workers {
            shutdown.send(()).unwrap();
        }
        for (worker, _) in self.workers.drain(..) {
            worker.join().unwrap();
        }
    }
}

fn start_tx_wait_worker<K: KVStore>(
    admitter: Admitter<K>,
    wait_queue: Arc<Mutex<Receiver<Submission>>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Tx-wait worker thread disconnected from main thread")
            }
        }

        let submission = wait_queue
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(100));
        match submission {
            Ok(submission) => {
                let origin = submission.origin;
                if let Err(err) = admitter.admit(submission) {
                    log::debug!(
                        "TxRejected, {}, {}",
                        origin.map_or_else(|| "local".to_string(), |origin| origin.to_string()),
                        err
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(100)),
        }
    })
}

fn start_broadcaster<M: Mesh>(
    mut mesh: M,
    messages: Receiver<(PublicKey, Envelope)>,
    wait_queue: SyncSender<Submission>,
    accepted: Receiver<(SignedTransaction, Option<PublicKey>)>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_flush = Instant::now();
        let mut batch: Vec<(SignedTransaction, Option<PublicKey>)> = Vec::new();
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Transaction broadcast thread disconnected from main thread")
                }
            }

            while let Ok((origin, envelope)) = messages.try_recv() {
                let message = match envelope.parse::<TransactionMessage>() {
                    Ok(message) => message,
                    Err(err) => {
                        penalize(&mut mesh, &origin, OVERSIZED_MESSAGE_POINTS, &err.to_string(), &event_publisher);
                        continue;
                    }
                };
                let count = message.transactions.len();
                if count > MAX_TRANSACTIONS_PER_MESSAGE || count != message.signatures.len() {
                    penalize(
                        &mut mesh,
                        &origin,
                        OVERSIZED_MESSAGE_POINTS,
                        &format!("too many transactions in message: {}", count),
                        &event_publisher,
                    );
                    continue;
                }
                for (transaction, signature) in message.transactions.into_iter().zip(message.signatures) {
                    let submission = Submission {
                        transaction,
                        signature,
                        origin: Some(origin),
                    };
                    if wait_queue.try_send(submission).is_err() {
                        log::debug!("WaitQueueFull, {}", origin);
                        break;
                    }
                }
            }

            while let Ok(accepted) = accepted.try_recv() {
                batch.push(accepted);
            }
            if last_flush.elapsed() >= BROADCAST_INTERVAL {
                while !batch.is_empty() {
                    let take = batch.len().min(MAX_TRANSACTIONS_PER_MESSAGE);
                    let chunk: Vec<_> = batch.drain(..take).collect();
                    gossip(&mut mesh, chunk);
                }
                last_flush = Instant::now();
            }
            thread::sleep(Duration::from_millis(10));
        }
    })
}

fn gossip<M: Mesh>(mesh: &mut M, chunk: Vec<(SignedTransaction, Option<PublicKey>)>) {
    let first_origin = chunk[0].1;
    let single_origin = first_origin.filter(|origin| chunk.iter().all(|(_, o)| *o == Some(*origin)));
    let (transactions, signatures) = chunk
        .into_iter()
        .map(|(tx, _)| {
            let mut transaction = tx.transaction;
            transaction.from = Default::default();
            (transaction, tx.signature)
        })
        .unzip();
    let packet = encode_packet(&TransactionMessage {
        transactions,
        signatures,
    });
    match single_origin {
        Some(origin) => mesh.except_cast(&origin, &packet),
        None => mesh.broadcast(&packet),
    }
}
