//! A token [`Application`]: admins `Mint` tokens into any account, accounts `Transfer` tokens to each
//! other through the token contract, and the total supply is kept in the contract's storage.

use borsh::{BorshDeserialize, BorshSerialize};
use pof_rs::{
    context::{
        application::{AppError, Application},
        Context,
    },
    store::{chain_store::ChainStore, pluggables::KVStore},
    types::{
        crypto_primitives::Keypair,
        data_types::{Address, ChainID, Signature},
        transaction::{unix_nanos, Transaction, TxID},
    },
};

pub(crate) const TOKEN_CONTRACT: Address = Address::new([0x70; 20]);
pub(crate) const BALANCE_KEY: &[u8] = b"balance";
pub(crate) const TOTAL_SUPPLY_KEY: &[u8] = b"total_supply";

pub(crate) const MINT: &str = "Mint";
pub(crate) const TRANSFER: &str = "Transfer";

/// Arguments of both methods: who receives, and how much.
#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct TokenArgs {
    pub(crate) to: Address,
    pub(crate) amount: u64,
}

pub(crate) struct TokenApp;

impl TokenApp {
    fn read_u64(bytes: Option<Vec<u8>>) -> Result<u64, AppError> {
        match bytes {
            None => Ok(0),
            Some(bytes) => u64::deserialize(&mut bytes.as_slice())
                .map_err(|err| AppError::Rejected(format!("corrupt value: {}", err))),
        }
    }

    fn args(tx: &Transaction) -> Result<TokenArgs, AppError> {
        TokenArgs::deserialize(&mut tx.args.as_slice())
            .map_err(|err| AppError::Rejected(format!("invalid args: {}", err)))
    }

    fn balance_of(ctx: &Context, address: &Address) -> Result<u64, AppError> {
        Self::read_u64(ctx.account_data(address, BALANCE_KEY))
    }

    fn set_balance(ctx: &mut Context, address: &Address, balance: u64) {
        ctx.set_account_data(address, BALANCE_KEY, balance.to_le_bytes().to_vec());
    }
}

impl Application for TokenApp {
    fn init_genesis(&self, ctx: &mut Context) -> Result<(), AppError> {
        ctx.set_contract_data(&TOKEN_CONTRACT, TOTAL_SUPPLY_KEY, 0u64.to_le_bytes().to_vec());
        Ok(())
    }

    fn validate_transaction(&self, _ctx: &Context, tx: &Transaction) -> Result<(), AppError> {
        match tx.method.as_str() {
            MINT | TRANSFER => Self::args(tx).map(|_| ()),
            other => Err(AppError::Unsupported(other.to_string())),
        }
    }

    fn execute_admin_transaction(
        &self,
        ctx: &mut Context,
        tx: &Transaction,
        _signer: &Address,
    ) -> Result<(), AppError> {
        if tx.method != MINT {
            return Err(AppError::Unsupported(tx.method.clone()));
        }
        let args = Self::args(tx)?;
        let supply = Self::read_u64(ctx.contract_data(&TOKEN_CONTRACT, TOTAL_SUPPLY_KEY))?;
        let balance = Self::balance_of(ctx, &args.to)?;
        Self::set_balance(ctx, &args.to, balance + args.amount);
        ctx.set_contract_data(
            &TOKEN_CONTRACT,
            TOTAL_SUPPLY_KEY,
            (supply + args.amount).to_le_bytes().to_vec(),
        );
        ctx.emit_event(MINT, tx.args.clone());
        Ok(())
    }

    fn execute_contract_transaction(
        &self,
        ctx: &mut Context,
        tx: &Transaction,
        signer: &Address,
        _id: TxID,
    ) -> Result<(), AppError> {
        if tx.to != TOKEN_CONTRACT || tx.method != TRANSFER {
            return Err(AppError::Unsupported(tx.method.clone()));
        }
        let args = Self::args(tx)?;
        let from_balance = Self::balance_of(ctx, signer)?;
        if from_balance < args.amount {
            return Err(AppError::Rejected("insufficient balance".to_string()));
        }
        Self::set_balance(ctx, signer, from_balance - args.amount);
        let to_balance = Self::balance_of(ctx, &args.to)?;
        Self::set_balance(ctx, &args.to, to_balance + args.amount);
        ctx.emit_event(TRANSFER, tx.args.clone());
        Ok(())
    }
}

pub(crate) fn total_supply<K: KVStore>(store: &ChainStore<K>) -> u64 {
    store
        .contract_data(&TOKEN_CONTRACT, TOTAL_SUPPLY_KEY)
        .map(|bytes| u64::deserialize(&mut bytes.as_slice()).unwrap())
        .unwrap_or(0)
}

pub(crate) fn balance<K: KVStore>(store: &ChainStore<K>, address: &Address) -> u64 {
    store
        .account_data(address, BALANCE_KEY)
        .map(|bytes| u64::deserialize(&mut bytes.as_slice()).unwrap())
        .unwrap_or(0)
}

/// A signed `Mint` from `admin`, stamped with the current time.
pub(crate) fn mint(chain_id: ChainID, admin: &Keypair, to: Address, amount: u64) -> (Transaction, Signature) {
    mint_at(chain_id, admin, to, amount, unix_nanos())
}

pub(crate) fn mint_at(
    chain_id: ChainID,
    admin: &Keypair,
    to: Address,
    amount: u64,
    timestamp: u64,
) -> (Transaction, Signature) {
    let tx = Transaction {
        chain_id,
        timestamp,
        to: Address::zero(),
        method: MINT.to_string(),
        args: TokenArgs { to, amount }.try_to_vec().unwrap(),
        ..Default::default()
    };
    let signature = tx.sign(admin);
    (tx, signature)
}

/// A signed, sequenced `Transfer` from `sender`.
pub(crate) fn transfer(
    chain_id: ChainID,
    sender: &Keypair,
    seq: u64,
    to: Address,
    amount: u64,
) -> (Transaction, Signature) {
    let tx = Transaction {
        chain_id,
        timestamp: unix_nanos(),
        seq,
        to: TOKEN_CONTRACT,
        method: TRANSFER.to_string(),
        args: TokenArgs { to, amount }.try_to_vec().unwrap(),
        use_seq: true,
        ..Default::default()
    };
    let signature = tx.sign(sender);
    (tx, signature)
}
