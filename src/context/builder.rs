/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::{
    store::pluggables::KVStore,
    types::{
        block::{receipts_hash, Block, Body, Header, Receipt},
        crypto_primitives::Keypair,
        data_types::{Address, Hash256},
        transaction::{SignedTransaction, TxID},
    },
};

use super::{committer::Committer, errors::ChainError, Context};

/// Assembles a block on a generator, executing each transaction as it is added.
///
/// A transaction that fails to execute leaves the context untouched and is not included; the caller
/// collects it as a dead letter.
pub struct BlockBuilder<'c, K: KVStore> {
    committer: &'c Committer<K>,
    ctx: Context,
    header: Header,
    transactions: Vec<SignedTransaction>,
    receipts: Vec<Receipt>,
}

impl<'c, K: KVStore> BlockBuilder<'c, K> {
    pub fn new(
        committer: &'c Committer<K>,
        ctx: Context,
        timestamp: u64,
        generator: Address,
        timeout_count: u32,
        consensus_data: Vec<u8>,
    ) -> Result<Self, ChainError> {
        let header = Header {
            version: committer.params().version,
            height: ctx.target_height(),
            prev_hash: ctx.last_hash(),
            level_root_hash: Hash256::zero(),
            context_hash: Hash256::zero(),
            timestamp,
            generator,
            timeout_count,
            consensus_data,
            receipt_hash: Hash256::zero(),
        };
        committer.validate_header(&ctx, &header)?;
        Ok(BlockBuilder {
            committer,
            ctx,
            header,
            transactions: Vec::new(),
            receipts: Vec::new(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn add_transaction(&mut self, tx: &SignedTransaction) -> Result<(), ChainError> {
        let id = TxID {
            height: self.header.height,
            index: self.transactions.len() as u16,
        };
        let receipt =
            self.committer
                .execute_transaction(&mut self.ctx, tx, self.header.time_slot(), id)?;
        self.transactions.push(tx.clone());
        self.receipts.push(receipt);
        Ok(())
    }

    /// Finish the header and sign it. Returns the block (carrying only the generator signature), the
    /// executed context, and the receipts.
    pub fn finalize(mut self, keypair: &Keypair) -> Result<(Block, Context, Vec<Receipt>), ChainError> {
        self.header.level_root_hash = Committer::<K>::level_root(&self.header.prev_hash, &self.transactions)?;
        self.committer.finalize(&mut self.ctx, &self.header)?;
        self.header.context_hash = self.ctx.hash();
        if self.header.version >= 2 {
            self.header.receipt_hash = receipts_hash(&self.receipts);
        }

        let generator_signature = keypair.sign(&self.header.hash());
        let (transactions, transaction_signatures) = self
            .transactions
            .into_iter()
            .map(|tx| {
                // `from` is not serialized; clear it so the block equals its decoded form.
                let mut transaction = tx.transaction;
                transaction.from = Address::zero();
                (transaction, tx.signature)
            })
            .unzip();
        let block = Block {
            header: self.header,
            body: Body {
                transactions,
                transaction_signatures,
                events: self.ctx.events(),
                block_signatures: vec![generator_signature],
            },
        };
        Ok((block, self.ctx, self.receipts))
    }
}
