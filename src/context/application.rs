/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable application that gives transactions their meaning.
//!
//! The committer decides *whether* and *in which order* transactions run, and takes care of time-slots,
//! sequences, and admin checks. The application decides *what* a transaction does, by reading and
//! writing the [`Context`] it is handed. Every method must be deterministic: observers, generators, and
//! nodes execute the same blocks independently and must reach the same context hash.

use crate::types::{
    block::{Header, Receipt},
    data_types::Address,
    transaction::{Transaction, TxID},
};

use super::Context;

pub trait Application: Send + Sync + 'static {
    /// Write the genesis state. Called once, on an empty context, by
    /// [`initialize`](crate::replica::initialize).
    fn init_genesis(&self, ctx: &mut Context) -> Result<(), AppError>;

    /// Cheap checks run on admission, before the transaction is pre-executed.
    fn validate_transaction(&self, _ctx: &Context, _tx: &Transaction) -> Result<(), AppError> {
        Ok(())
    }

    /// Execute a transaction sent to the zero address. `signer` has already been checked to be an admin.
    fn execute_admin_transaction(
        &self,
        ctx: &mut Context,
        tx: &Transaction,
        signer: &Address,
    ) -> Result<(), AppError>;

    fn execute_contract_transaction(
        &self,
        ctx: &mut Context,
        tx: &Transaction,
        signer: &Address,
        id: TxID,
    ) -> Result<(), AppError>;

    /// Execute an ether-type transaction. `v` is the EIP-155 legacy `v` of its signature.
    fn execute_ether_transaction(
        &self,
        _ctx: &mut Context,
        _tx: &Transaction,
        _signer: &Address,
        _v: u64,
    ) -> Result<Receipt, AppError> {
        Err(AppError::Unsupported("ether transactions".to_string()))
    }

    /// Called after the transactions of every block whose height is a multiple of the reward interval.
    fn process_reward(&self, _ctx: &mut Context, _header: &Header) -> Result<(), AppError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Rejected(String),
}
