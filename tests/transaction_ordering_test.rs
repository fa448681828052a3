use std::time::Duration;

use log::LevelFilter;
use pof_rs::types::transaction::SignedTransaction;

mod common;

use common::{
    cluster::{wait_until, Cluster, CHAIN_ID},
    keys,
    logging::{log_step, setup_logger},
    token_app::{balance, mint, total_supply, transfer},
};

/// Tests that sequenced transactions submitted out of order are committed in sequence order.
#[test]
fn transaction_ordering_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a network with 3 observers, 2 generators, and 1 node.
    log_step(1, "Starting 3 observers, 2 generators, and 1 node.");
    let mut cluster = Cluster::new(3, 2, 1);
    cluster.start_all();

    // 2. Fund the sender.
    log_step(2, "Minting 1 000 tokens to the sender.");
    let sender = keys::keypair(0xE0, 1);
    let recipient = keys::keypair(0xE0, 2).address();
    let (tx, signature) = mint(CHAIN_ID, &keys::admin(), sender.address(), 1_000);
    cluster.generator(0).submit_transaction(tx, signature).unwrap();
    assert!(wait_until(Duration::from_secs(30), || {
        balance(&cluster.generator_stores[0], &sender.address()) == 1_000
    }));

    // 3. Submit three transfers with sequences 2, 1, 0, in that order.
    log_step(3, "Submitting three transfers in reverse sequence order.");
    let seq = cluster.generator_stores[0].seq(&sender.address()).unwrap();
    assert_eq!(seq, 0);
    for (offset, amount) in [(2, 300), (1, 200), (0, 100)] {
        let (tx, signature) = transfer(CHAIN_ID, &sender, seq + offset, recipient, amount);
        cluster.generator(0).submit_transaction(tx, signature).unwrap();
    }

    // 4. Wait for all three to commit.
    log_step(4, "Waiting for the transfers to commit.");
    let store = cluster.observer_stores[0].clone();
    assert!(wait_until(Duration::from_secs(30), || balance(&store, &recipient) == 600));
    assert_eq!(balance(&store, &sender.address()), 400);
    assert_eq!(total_supply(&store), 1_000);
    assert_eq!(store.seq(&sender.address()).unwrap(), 3);

    // 5. The transfers appear in sequence order along the chain.
    log_step(5, "Checking the committed order.");
    let mut committed_seqs = Vec::new();
    for height in 1..=store.height() {
        let block = store.block(height).unwrap().unwrap();
        for (tx, signature) in block.body.transactions.iter().zip(&block.body.transaction_signatures) {
            let signed = SignedTransaction::recover(tx.clone(), *signature).unwrap();
            if signed.signer() == sender.address() {
                committed_seqs.push(signed.transaction.seq);
            }
        }
    }
    assert_eq!(committed_seqs, vec![seq, seq + 1, seq + 2]);
    cluster.assert_same_chain();
}
