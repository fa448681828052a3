/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The committer: deterministic block execution, header verification, and the append into the store.
//!
//! ## Executing a block
//!
//! [`Committer::execute_block`] runs, in order:
//! 1. Header validation against the context ([`Committer::validate_header`]).
//! 2. Signer recovery for every transaction, in parallel for large blocks, followed by the level-root
//!    check over `[prev_hash, tx_hash₁, …]`.
//! 3. Each transaction in its own snapshot ([`Committer::execute_transaction`]). The first failure
//!    aborts the block.
//! 4. [`Committer::finalize`]: the consensus hook, reward processing on reward heights, and the
//!    dirty-context guard.
//! 5. The context-hash, event, and receipt-hash checks against the header.
//!
//! Generators run steps 3 and 4 through the [`BlockBuilder`](super::builder::BlockBuilder) instead, so
//! both sides compute the same context.

use std::{sync::Arc, thread};

use crate::{
    config::ProtocolParams,
    store::{chain_store::ChainStore, pluggables::KVStore},
    types::{
        block::{receipts_hash, Block, Header, Receipt},
        crypto_primitives::{eip155_v, SignatureError},
        data_types::{Hash256, Signature},
        level_root::build_level_root,
        transaction::{SignedTransaction, Transaction, TransactionType, TxID},
    },
};

use super::{application::Application, errors::ChainError, hook::ConsensusHook, Context};

/// Blocks with at least this many transactions recover their signers on several threads.
pub const PARALLEL_RECOVERY_THRESHOLD: usize = 1000;

#[derive(Clone)]
pub struct Committer<K: KVStore> {
    store: ChainStore<K>,
    app: Arc<dyn Application>,
    hook: Arc<dyn ConsensusHook>,
    params: ProtocolParams,
}

impl<K: KVStore> Committer<K> {
    pub fn new(
        store: ChainStore<K>,
        app: Arc<dyn Application>,
        hook: Arc<dyn ConsensusHook>,
        params: ProtocolParams,
    ) -> Committer<K> {
        Committer {
            store,
            app,
            hook,
            params,
        }
    }

    pub fn store(&self) -> &ChainStore<K> {
        &self.store
    }

    pub fn app(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// A context for the block after the store's tip.
    pub fn new_context(&self) -> Result<Context, ChainError> {
        Context::new(&self.store)
    }

    pub fn validate_header(&self, ctx: &Context, header: &Header) -> Result<(), ChainError> {
        if header.version > self.params.version {
            return Err(ChainError::InvalidVersion {
                max: self.params.version,
                found: header.version,
            });
        }
        if header.height != ctx.target_height() {
            return Err(ChainError::InvalidHeight {
                expected: ctx.target_height(),
                found: header.height,
            });
        }
        if header.prev_hash != ctx.last_hash() {
            return Err(ChainError::InvalidPrevHash {
                expected: ctx.last_hash(),
            });
        }
        if header.timestamp <= ctx.last_timestamp() {
            return Err(ChainError::InvalidTimestamp {
                previous: ctx.last_timestamp(),
                found: header.timestamp,
            });
        }
        Ok(())
    }

    /// Recover the signer of every transaction in `block`, preserving order.
    pub fn recover_transactions(&self, block: &Block) -> Result<Vec<SignedTransaction>, ChainError> {
        let body = &block.body;
        if body.transactions.len() != body.transaction_signatures.len() {
            return Err(SignatureError::InsufficientSignature.into());
        }
        let pairs: Vec<(&Transaction, &Signature)> = body
            .transactions
            .iter()
            .zip(body.transaction_signatures.iter())
            .collect();

        let chain_id = self.params.chain_id;
        let recover = move |chunk: &[(&Transaction, &Signature)]| {
            chunk
                .iter()
                .map(|(tx, signature)| {
                    if !tx.is_valid_for(chain_id) {
                        return Err(ChainError::InvalidChainID);
                    }
                    Ok(SignedTransaction::recover((*tx).clone(), **signature)?)
                })
                .collect::<Result<Vec<SignedTransaction>, ChainError>>()
        };

        if pairs.len() < PARALLEL_RECOVERY_THRESHOLD {
            return recover(pairs.as_slice());
        }

        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let chunk_len = (pairs.len() + workers - 1) / workers;
        thread::scope(|scope| {
            let handles: Vec<_> = pairs
                .chunks(chunk_len)
                .map(|chunk| scope.spawn(move || recover(chunk)))
                .collect();
            let mut recovered = Vec::with_capacity(pairs.len());
            for handle in handles {
                let chunk = handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
                recovered.extend(chunk);
            }
            Ok(recovered)
        })
    }

    /// The level root over `[prev_hash, tx_hash₁, …, tx_hashₙ]`.
    pub fn level_root(prev_hash: &Hash256, txs: &[SignedTransaction]) -> Result<Hash256, ChainError> {
        let mut hashes = Vec::with_capacity(txs.len() + 1);
        hashes.push(*prev_hash);
        hashes.extend(txs.iter().map(|tx| tx.hash));
        Ok(build_level_root(&hashes)?)
    }

    /// Execute one transaction in its own snapshot. On failure the snapshot is reverted and `ctx` is
    /// left as it was.
    pub fn execute_transaction(
        &self,
        ctx: &mut Context,
        tx: &SignedTransaction,
        block_slot: u64,
        id: TxID,
    ) -> Result<Receipt, ChainError> {
        let slot = tx.time_slot();
        if slot + 1 < block_slot || slot > block_slot {
            return Err(ChainError::InvalidTransactionTimeSlot { slot, block_slot });
        }

        let snapshot = ctx.snapshot();
        ctx.set_tx_index(id.index);
        match self.apply_transaction(ctx, tx, slot, id) {
            Ok(receipt) => {
                ctx.commit(snapshot);
                Ok(receipt)
            }
            Err(err) => {
                ctx.revert(snapshot);
                Err(err)
            }
        }
    }

    fn apply_transaction(
        &self,
        ctx: &mut Context,
        tx: &SignedTransaction,
        slot: u64,
        id: TxID,
    ) -> Result<Receipt, ChainError> {
        ctx.use_time_slot(slot, &tx.hash)?;

        let signer = tx.signer();
        let transaction = &tx.transaction;
        if transaction.is_sequenced() {
            let expected = ctx.seq(&signer)?;
            if transaction.seq != expected {
                return Err(ChainError::InvalidSequence {
                    expected,
                    found: transaction.seq,
                });
            }
            ctx.add_seq(&signer)?;
        }

        match transaction.transaction_type() {
            TransactionType::Admin => {
                if !ctx.admins()?.contains(&signer) {
                    return Err(ChainError::NotAdmin(signer));
                }
                self.app.execute_admin_transaction(ctx, transaction, &signer)?;
                Ok(Receipt::default())
            }
            TransactionType::Ether => {
                let v = eip155_v(&tx.signature, self.params.chain_id);
                Ok(self.app.execute_ether_transaction(ctx, transaction, &signer, v)?)
            }
            TransactionType::Contract => {
                self.app.execute_contract_transaction(ctx, transaction, &signer, id)?;
                Ok(Receipt::default())
            }
        }
    }

    /// Run the end-of-block steps shared by producers and validators: the consensus hook, rewards, and
    /// the dirty-context guard.
    pub fn finalize(&self, ctx: &mut Context, header: &Header) -> Result<(), ChainError> {
        self.hook.apply_block(ctx, header)?;

        if self.params.reward_interval > 0 && header.height % self.params.reward_interval == 0 {
            let parent = header.height - 1;
            if self.store.height() < parent
                && !self.store.wait_height(parent, self.params.block_time * 10)
            {
                return Err(ChainError::ConnectedBlockTimeout(parent));
            }
            self.app.process_reward(ctx, header)?;
        }

        if ctx.depth() > 1 {
            return Err(ChainError::DirtyContext(ctx.depth()));
        }
        Ok(())
    }

    /// Execute `block` on `ctx` and check the result against its header. Returns the executed context
    /// and the receipts, ready for [`ChainStore::append_block`].
    pub fn execute_block(
        &self,
        mut ctx: Context,
        block: &Block,
    ) -> Result<(Context, Vec<Receipt>), ChainError> {
        let header = &block.header;
        self.validate_header(&ctx, header)?;

        let txs = self.recover_transactions(block)?;
        if Self::level_root(&header.prev_hash, &txs)? != header.level_root_hash {
            return Err(ChainError::InvalidLevelRootHash);
        }

        let block_slot = header.time_slot();
        let mut receipts = Vec::with_capacity(txs.len());
        for (index, tx) in txs.iter().enumerate() {
            let id = TxID {
                height: header.height,
                index: index as u16,
            };
            receipts.push(self.execute_transaction(&mut ctx, tx, block_slot, id)?);
        }

        self.finalize(&mut ctx, header)?;

        if ctx.hash() != header.context_hash || ctx.events() != block.body.events {
            return Err(ChainError::InvalidContextHash);
        }
        if header.version >= 2 && receipts_hash(&receipts) != header.receipt_hash {
            return Err(ChainError::InvalidReceiptHash);
        }
        Ok((ctx, receipts))
    }

    /// Validate, execute, and append the block after the store's tip.
    pub fn connect_block(&self, block: &Block) -> Result<(), ChainError> {
        self.hook.validate_signatures(block)?;
        let ctx = self.new_context()?;
        let (ctx, receipts) = self.execute_block(ctx, block)?;
        self.store.append_block(block, &ctx.delta(), &receipts)?;
        Ok(())
    }

    /// Append a block that was already executed on `ctx`, skipping re-execution.
    pub fn connect_block_with_context(
        &self,
        block: &Block,
        ctx: &Context,
        receipts: &[Receipt],
    ) -> Result<(), ChainError> {
        self.hook.validate_signatures(block)?;
        let header = &block.header;
        let tip = self.store.tip();
        if header.height != tip.height + 1 || ctx.target_height() != header.height {
            return Err(ChainError::InvalidHeight {
                expected: tip.height + 1,
                found: header.height,
            });
        }
        if header.prev_hash != tip.hash || ctx.last_hash() != tip.hash {
            return Err(ChainError::InvalidPrevHash { expected: tip.hash });
        }
        if ctx.hash() != header.context_hash {
            return Err(ChainError::InvalidContextHash);
        }
        self.store.append_block(block, &ctx.delta(), receipts)?;
        Ok(())
    }

    /// Execute `tx` on a scratch context over the store's tip, as the pool's admission check.
    ///
    /// The signer's sequence is set to the transaction's own, so transactions waiting on earlier
    /// sequences are not rejected.
    pub fn pre_execute(&self, tx: &SignedTransaction) -> Result<(), ChainError> {
        let mut ctx = self.new_context()?;
        self.app.validate_transaction(&ctx, &tx.transaction)?;
        if tx.transaction.is_sequenced() {
            ctx.set_seq(&tx.signer(), tx.transaction.seq);
        }
        let id = TxID {
            height: ctx.target_height(),
            index: 0,
        };
        self.execute_transaction(&mut ctx, tx, tx.time_slot(), id)?;
        Ok(())
    }

    /// Re-execute every block that reached the pile but not the key-value store before a crash.
    pub fn replay_pile(&self) -> Result<u32, ChainError> {
        self.store
            .iter_block_after_context(|block: Block| self.connect_block(&block))
    }
}
