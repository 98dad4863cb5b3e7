//! End-to-end chain flow: mining, funding a wallet from coinbase outputs,
//! spending through the pool, and rolling the tip back.

use quartz_core::{
    to_binary, Hash, PreparedBlock, PublicKey, RawBlock, Transaction, TransactionInput,
    TransactionOutput, TransactionPrefix, TransactionSignatures,
};
use quartz_cryptography::{fast_hash, generate_key_image, generate_ring_signature, random_keypair};
use quartz_ledger::{BlockChainState, Config, Currency};
use quartz_persistence::{MemoryStore, RocksDbStore, Store};
use std::sync::Arc;

fn open_chain(currency: Currency) -> BlockChainState {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    BlockChainState::new(store, currency, Config::default()).unwrap()
}

/// Mines one template block to `miner` and returns the prepared block
/// that was applied.
fn mine_block(chain: &mut BlockChainState, miner: PublicKey, now: u64) -> PreparedBlock {
    let template = chain
        .create_mining_block_template(miner, &[], now)
        .unwrap();
    let transactions = template
        .block
        .transaction_hashes
        .iter()
        .map(|hash| chain.pool_transaction(hash).unwrap().binary.clone())
        .collect();
    let raw_block = RawBlock {
        block: to_binary(&template.block),
        transactions,
    };
    let block = PreparedBlock::prepare(raw_block, fast_hash).unwrap();
    chain.add_block(&block, now).unwrap();
    block
}

#[test]
fn test_mine_fund_spend_and_reorg() {
    let mut chain = open_chain(Currency::default());
    let mut rng = rand::thread_rng();
    let (miner_public, miner_secret) = random_keypair(&mut rng);
    let target = chain.currency().difficulty_target;
    let mut now = chain.tip().timestamp;

    // Mine past the coinbase unlock window.
    let mut first_block_hash = Hash::ZERO;
    for i in 0..11 {
        now += target;
        let block = mine_block(&mut chain, miner_public, now);
        if i == 0 {
            first_block_hash = block.hash;
        }
    }
    assert_eq!(chain.tip_height(), 11);

    // Spend the largest coinbase output of the first mined block.
    let header = chain.get_header(&first_block_hash).unwrap().unwrap();
    let indices = chain
        .read_block_output_global_indices(&first_block_hash)
        .unwrap()
        .unwrap();
    assert_eq!(chain.hash_by_height(1).unwrap(), Some(first_block_hash));

    let outputs = {
        // Rebuild the coinbase deterministically to learn the amounts.
        let reward = header.reward;
        let currency = chain.currency();
        currency
            .construct_miner_tx(1, 1, reward, miner_public, &[], None)
            .unwrap()
            .prefix
            .outputs
    };
    let last = outputs.len() - 1;
    let TransactionOutput::Key { amount, .. } = outputs[last];
    let global_index = indices[0][last];
    let key_image = generate_key_image(&miner_public, &miner_secret).unwrap();
    let prefix = TransactionPrefix {
        version: 1,
        unlock_block_or_timestamp: 0,
        inputs: vec![TransactionInput::Key {
            amount,
            output_offsets: vec![global_index],
            key_image,
        }],
        outputs: vec![TransactionOutput::Key {
            amount: amount / 10,
            public_key: random_keypair(&mut rng).0,
            is_auditable: false,
        }],
        extra: Vec::new(),
    };
    let prefix_hash = fast_hash(&to_binary(&prefix));
    let signatures = generate_ring_signature(
        &prefix_hash,
        &key_image,
        &[miner_public],
        &miner_secret,
        0,
        &mut rng,
    )
    .unwrap();
    let tx = Transaction {
        prefix,
        signatures: TransactionSignatures::Ring(vec![signatures]),
    };
    let binary = to_binary(&tx);
    let tid = fast_hash(&binary);
    let fee = amount - amount / 10;
    assert!(chain.add_transaction(tid, tx, binary, now).unwrap());
    assert_eq!(chain.pool_statistics().count, 1);

    // The next mined block confirms the spend and empties the pool.
    now += target;
    let spend_block = mine_block(&mut chain, miner_public, now);
    assert_eq!(chain.tip_height(), 12);
    let info = chain.get_header(&spend_block.hash).unwrap().unwrap();
    assert_eq!(info.transactions_fee, fee);
    assert_eq!(chain.pool_statistics().count, 0);

    // Rolling the tip back returns the transaction to the pool.
    let undone = chain.undo_tip_block(&spend_block).unwrap();
    assert_eq!(undone.len(), 1);
    assert_eq!(chain.tip_height(), 11);
    chain.on_reorganization(undone, now).unwrap();
    assert_eq!(chain.pool_statistics().count, 1);
    assert!(chain.pool_transaction(&tid).is_some());

    // And it confirms again on the rebuilt chain.
    now += target;
    mine_block(&mut chain, miner_public, now);
    assert_eq!(chain.tip_height(), 12);
    assert_eq!(chain.pool_statistics().count, 0);
}

#[test]
fn test_amethyst_template_votes_capacity() {
    let currency = Currency {
        amethyst_fork_height: 0,
        ..Currency::default()
    };
    let mut chain = open_chain(currency);
    let mut rng = rand::thread_rng();
    let (miner_public, _) = random_keypair(&mut rng);
    let mut now = chain.tip().timestamp;
    for expected_height in 1..=2 {
        now += chain.currency().difficulty_target;
        let block = mine_block(&mut chain, miner_public, now);
        let info = chain.get_header(&block.hash).unwrap().unwrap();
        assert_eq!(info.height, expected_height);
        assert_eq!(info.major_version, 4);
        assert_eq!(
            info.block_capacity_vote,
            Some(chain.currency().block_capacity_vote_min as u64)
        );
    }
}

#[test]
fn test_amethyst_block_without_vote_rejected() {
    let currency = Currency {
        amethyst_fork_height: 0,
        ..Currency::default()
    };
    let mut chain = open_chain(currency);
    let mut rng = rand::thread_rng();
    let (miner_public, _) = random_keypair(&mut rng);
    let now = chain.tip().timestamp + chain.currency().difficulty_target;
    let mut template = chain
        .create_mining_block_template(miner_public, &[], now)
        .unwrap();
    // Strip the vote by rebuilding the coinbase without one.
    let reward = chain.currency().base_block_reward(
        chain.tip().already_generated_coins,
    );
    template.block.base_transaction = chain
        .currency()
        .construct_miner_tx(4, 1, reward, miner_public, &[], None)
        .unwrap();
    let raw_block = RawBlock {
        block: to_binary(&template.block),
        transactions: Vec::new(),
    };
    let block = PreparedBlock::prepare(raw_block, fast_hash).unwrap();
    let err = chain.add_block(&block, now).unwrap_err();
    assert!(err.to_string().contains("capacity vote"), "{err}");
}

#[test]
fn test_rocksdb_chain_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut rng = rand::thread_rng();
    let (miner_public, _miner_secret) = random_keypair(&mut rng);

    let tip_hash;
    {
        let store: Arc<dyn Store> = Arc::new(RocksDbStore::open(dir.path()).unwrap());
        let mut chain = BlockChainState::new(store, Currency::default(), Config::default()).unwrap();
        let target = chain.currency().difficulty_target;
        let mut now = chain.tip().timestamp;
        for _ in 0..3 {
            now += target;
            mine_block(&mut chain, miner_public, now);
        }
        assert_eq!(chain.tip_height(), 3);
        tip_hash = chain.tip_hash();
    }

    let store: Arc<dyn Store> = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    let chain = BlockChainState::new(store, Currency::default(), Config::default()).unwrap();
    assert_eq!(chain.tip_height(), 3);
    assert_eq!(chain.tip_hash(), tip_hash);
    assert_eq!(chain.hash_by_height(3).unwrap(), Some(tip_hash));
    let header = chain.get_header(&tip_hash).unwrap().unwrap();
    assert_eq!(header.height, 3);
}
