//! The chain facade: header store, tip tracking, block application and
//! the cached medians the validator and template builder read.

use crate::currency::Currency;
use crate::pool::TransactionPool;
use crate::replay;
use crate::state::{keys, LedgerState};
use crate::{Error, Result};
use quartz_core::{
    from_binary, to_binary, Amount, CumulativeDifficulty, Difficulty, Hash, Height, PreparedBlock,
    Timestamp, Transaction,
};
use quartz_cryptography::fast_hash;
use quartz_persistence::{Store, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const DB_VERSION: &[u8] = b"1";

/// Everything the node keeps per accepted block header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    pub hash: Hash,
    pub height: Height,
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: Timestamp,
    pub previous_block_hash: Hash,
    pub binary_nonce: Vec<u8>,
    /// Timestamp median this block was validated against.
    pub timestamp_median: Timestamp,
    pub block_size: usize,
    pub transactions_size: usize,
    pub base_reward: Amount,
    pub reward: Amount,
    pub already_generated_coins: Amount,
    pub already_generated_transactions: u64,
    pub difficulty: Difficulty,
    pub cumulative_difficulty: CumulativeDifficulty,
    pub transactions_fee: Amount,
    pub block_capacity_vote: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Pool admission cap in bytes of binary transaction size.
    pub max_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pool_size: 4_000_000,
        }
    }
}

/// Summary counters for status reporting.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BlockChainStatistics {
    pub tip_hash: Hash,
    pub tip_height: Height,
    pub already_generated_coins: Amount,
    pub already_generated_transactions: u64,
    pub transaction_pool_count: usize,
    pub transaction_pool_size: usize,
    pub transaction_pool_version: u64,
}

/// Consensus-enforcing state of the main chain: the output/key-image
/// ledger, the header index, the fee-ordered transaction pool and the
/// medians derived from the tip segment.
pub struct BlockChainState {
    store: Arc<dyn Store>,
    currency: Currency,
    pub(crate) ledger: LedgerState,
    pub(crate) pool: TransactionPool,
    /// Binary transactions handed out in recent mining templates, kept so
    /// a mined block can be assembled even after the pool moved on.
    pub(crate) mining_transactions: HashMap<Hash, (Vec<u8>, Height)>,
    tip: BlockHeaderInfo,
    next_median_timestamp: Timestamp,
    next_median_block_size: usize,
    next_median_capacity_vote: u64,
}

/// Median of a non-empty window; even-length windows average the two
/// middle values.
fn median_value(values: &mut [u64]) -> u64 {
    values.sort_unstable();
    let n = values.len();
    (values[(n - 1) / 2] + values[n / 2]) / 2
}

impl BlockChainState {
    pub fn new(store: Arc<dyn Store>, currency: Currency, config: Config) -> Result<Self> {
        match store.get(keys::VERSION_KEY)? {
            None => store.put(keys::VERSION_KEY, DB_VERSION)?,
            Some(v) if v == DB_VERSION => {}
            Some(v) => {
                return Err(Error::Invariant(format!(
                    "unsupported database version {:?}",
                    String::from_utf8_lossy(&v)
                )))
            }
        }
        let mut ledger = LedgerState::new(store.clone())?;
        let tip = match store.get(keys::TIP_KEY)? {
            Some(bytes) => {
                let hash = Hash::from_slice(&bytes).ok_or_else(|| {
                    Error::Invariant("tip record is not a 32-byte hash".into())
                })?;
                let info: BlockHeaderInfo = match store.get(&keys::header(&hash))? {
                    Some(bytes) => from_binary(&bytes)?,
                    None => {
                        return Err(Error::Invariant(format!(
                            "tip header {} missing",
                            hash
                        )))
                    }
                };
                info
            }
            None => Self::bootstrap_genesis(&store, &currency, &mut ledger)?,
        };
        info!(height = tip.height, hash = %tip.hash, "blockchain state opened");
        let mut chain = Self {
            pool: TransactionPool::new(config.max_pool_size),
            store,
            currency,
            ledger,
            mining_transactions: HashMap::new(),
            tip,
            next_median_timestamp: 0,
            next_median_block_size: 0,
            next_median_capacity_vote: 0,
        };
        chain.tip_changed()?;
        Ok(chain)
    }

    fn bootstrap_genesis(
        store: &Arc<dyn Store>,
        currency: &Currency,
        ledger: &mut LedgerState,
    ) -> Result<BlockHeaderInfo> {
        let block = PreparedBlock::from_block(currency.genesis_block()?, fast_hash)?;
        let base_reward = currency.base_block_reward(0);
        let info = BlockHeaderInfo {
            hash: block.hash,
            height: 0,
            major_version: block.block.header.major_version,
            minor_version: block.block.header.minor_version,
            timestamp: block.block.header.timestamp,
            previous_block_hash: Hash::ZERO,
            binary_nonce: block.block.header.nonce.clone(),
            timestamp_median: block.block.header.timestamp,
            block_size: block.coinbase_tx_size + block.header_size,
            transactions_size: block.coinbase_tx_size,
            base_reward,
            reward: base_reward,
            already_generated_coins: base_reward,
            already_generated_transactions: 1,
            difficulty: 1,
            cumulative_difficulty: 1,
            transactions_fee: 0,
            block_capacity_vote: None,
        };
        let indices = replay::redo_block(ledger, currency, &block, &info, false)?;
        let mut batch = WriteBatch::new();
        batch.put(keys::header(&info.hash), to_binary(&info));
        batch.put(keys::height_index(0), info.hash.as_bytes().to_vec());
        batch.put(
            keys::block_global_indices(&info.hash),
            to_binary(&indices),
        );
        batch.put(keys::TIP_KEY.to_vec(), info.hash.as_bytes().to_vec());
        store.write(batch)?;
        info!(hash = %info.hash, "genesis block applied");
        Ok(info)
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn tip(&self) -> &BlockHeaderInfo {
        &self.tip
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip.hash
    }

    pub fn tip_height(&self) -> Height {
        self.tip.height
    }

    pub(crate) fn next_median_timestamp(&self) -> Timestamp {
        self.next_median_timestamp
    }

    pub(crate) fn next_median_capacity_vote(&self) -> u64 {
        self.next_median_capacity_vote
    }

    /// Pre-amethyst size limit base: the rolling median floored by the
    /// protocol minimum.
    pub(crate) fn effective_median_size(&self) -> usize {
        std::cmp::max(self.next_median_block_size, self.currency.minimum_size_median)
    }

    pub fn get_header(&self, hash: &Hash) -> Result<Option<BlockHeaderInfo>> {
        match self.store.get(&keys::header(hash))? {
            Some(bytes) => Ok(Some(from_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Main-chain block hash at a height, if within the chain.
    pub fn hash_by_height(&self, height: Height) -> Result<Option<Hash>> {
        match self.store.get(&keys::height_index(height))? {
            Some(bytes) => Ok(Hash::from_slice(&bytes)),
            None => Ok(None),
        }
    }

    pub fn header_by_height(&self, height: Height) -> Result<Option<BlockHeaderInfo>> {
        match self.hash_by_height(height)? {
            Some(hash) => self.get_header(&hash),
            None => Ok(None),
        }
    }

    /// Per-transaction output global indices of an applied block, coinbase
    /// first.
    pub fn read_block_output_global_indices(&self, hash: &Hash) -> Result<Option<Vec<Vec<u64>>>> {
        match self.store.get(&keys::block_global_indices(hash))? {
            Some(bytes) => Ok(Some(from_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Validates and applies a block on top of the current tip.
    pub fn add_block(&mut self, block: &PreparedBlock, now: Timestamp) -> Result<BlockHeaderInfo> {
        if self.get_header(&block.hash)?.is_some() {
            return Err(Error::Consensus(format!(
                "block {} is already in the chain",
                block.hash
            )));
        }
        if block.block.header.previous_block_hash != self.tip.hash {
            return Err(Error::Consensus(format!(
                "block {} does not extend the tip {}",
                block.hash, self.tip.hash
            )));
        }
        let prev_info = self.tip.clone();
        let info = self.check_standalone_consensus(block, &prev_info, now)?;
        let check_sigs = !self.currency.is_in_hard_checkpoint_zone(info.height);
        let indices = replay::redo_block(&mut self.ledger, &self.currency, block, &info, check_sigs)?;
        let mut batch = WriteBatch::new();
        batch.put(keys::header(&info.hash), to_binary(&info));
        batch.put(keys::height_index(info.height), info.hash.as_bytes().to_vec());
        batch.put(
            keys::block_global_indices(&info.hash),
            to_binary(&indices),
        );
        batch.put(keys::TIP_KEY.to_vec(), info.hash.as_bytes().to_vec());
        self.store.write(batch)?;
        self.tip = info.clone();
        self.tip_changed()?;
        self.remove_confirmed_transactions(block);
        self.prune_mining_transactions();
        info!(
            height = info.height,
            hash = %info.hash,
            transactions = block.block.transactions.len(),
            "block applied"
        );
        Ok(info)
    }

    /// Reverses the tip block; the caller supplies its body. Returns the
    /// non-coinbase transactions so they can be returned to the pool.
    pub fn undo_tip_block(&mut self, block: &PreparedBlock) -> Result<Vec<Transaction>> {
        if block.hash != self.tip.hash {
            return Err(Error::Invariant(format!(
                "undo of {} but tip is {}",
                block.hash, self.tip.hash
            )));
        }
        if self.tip.height == 0 {
            return Err(Error::Invariant("cannot undo the genesis block".into()));
        }
        replay::undo_block(&mut self.ledger, block)?;
        let prev = self
            .get_header(&self.tip.previous_block_hash)?
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "previous header {} missing during undo",
                    self.tip.previous_block_hash
                ))
            })?;
        let mut batch = WriteBatch::new();
        batch.delete(keys::height_index(self.tip.height));
        batch.delete(keys::block_global_indices(&self.tip.hash));
        batch.delete(keys::header(&self.tip.hash));
        batch.put(keys::TIP_KEY.to_vec(), prev.hash.as_bytes().to_vec());
        self.store.write(batch)?;
        info!(height = self.tip.height, hash = %self.tip.hash, "block undone");
        self.tip = prev;
        self.tip_changed()?;
        Ok(block.block.transactions.clone())
    }

    /// Tip headers, newest first, up to `count`.
    pub(crate) fn tip_segment(&self, count: usize) -> Result<Vec<BlockHeaderInfo>> {
        let mut segment = Vec::with_capacity(count);
        let mut current = self.tip.clone();
        loop {
            let at_genesis = current.height == 0;
            let previous = current.previous_block_hash;
            segment.push(current);
            if segment.len() >= count || at_genesis {
                return Ok(segment);
            }
            current = self.get_header(&previous)?.ok_or_else(|| {
                Error::Invariant(format!("chain header {} missing", previous))
            })?;
        }
    }

    /// Timestamps and cumulative difficulties for the retarget, oldest
    /// first, ending at `last`.
    pub(crate) fn difficulty_inputs(
        &self,
        last: &BlockHeaderInfo,
    ) -> Result<(Vec<Timestamp>, Vec<CumulativeDifficulty>)> {
        let count = self.currency.difficulty_window + self.currency.difficulty_lag;
        let mut timestamps = Vec::with_capacity(count);
        let mut difficulties = Vec::with_capacity(count);
        let mut current = last.clone();
        loop {
            timestamps.push(current.timestamp);
            difficulties.push(current.cumulative_difficulty);
            if timestamps.len() >= count || current.height == 0 {
                break;
            }
            current = self
                .get_header(&current.previous_block_hash)?
                .ok_or_else(|| {
                    Error::Invariant(format!(
                        "chain header {} missing",
                        current.previous_block_hash
                    ))
                })?;
        }
        timestamps.reverse();
        difficulties.reverse();
        Ok((timestamps, difficulties))
    }

    /// Recomputes the medians derived from the tip segment. Called after
    /// every tip move.
    fn tip_changed(&mut self) -> Result<()> {
        let window = std::cmp::max(
            self.currency.timestamp_check_window,
            self.currency.median_block_size_window,
        );
        let segment = self.tip_segment(window)?;

        let mut timestamps: Vec<Timestamp> = segment
            .iter()
            .take(self.currency.timestamp_check_window)
            .map(|h| h.timestamp)
            .collect();
        self.next_median_timestamp = median_value(&mut timestamps);

        let mut sizes: Vec<u64> = segment
            .iter()
            .take(self.currency.median_block_size_window)
            .map(|h| h.transactions_size as u64)
            .collect();
        self.next_median_block_size = median_value(&mut sizes) as usize;

        let vote_min = self.currency.block_capacity_vote_min as u64;
        let vote_max = self.currency.block_capacity_vote_max as u64;
        let mut votes: Vec<u64> = segment
            .iter()
            .take(self.currency.median_block_size_window)
            .map(|h| h.block_capacity_vote.unwrap_or(vote_min))
            .collect();
        self.next_median_capacity_vote = median_value(&mut votes).clamp(vote_min, vote_max);
        Ok(())
    }

    pub fn fill_statistics(&self) -> BlockChainStatistics {
        BlockChainStatistics {
            tip_hash: self.tip.hash,
            tip_height: self.tip.height,
            already_generated_coins: self.tip.already_generated_coins,
            already_generated_transactions: self.tip.already_generated_transactions,
            transaction_pool_count: self.pool.len(),
            transaction_pool_size: self.pool.total_size(),
            transaction_pool_version: self.pool.version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_persistence::MemoryStore;

    fn open_chain(store: Arc<dyn Store>) -> BlockChainState {
        BlockChainState::new(store, Currency::default(), Config::default()).unwrap()
    }

    #[test]
    fn test_genesis_bootstrap_and_reopen() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let genesis_hash;
        {
            let chain = open_chain(store.clone());
            assert_eq!(chain.tip_height(), 0);
            genesis_hash = chain.tip_hash();
            assert_eq!(chain.hash_by_height(0).unwrap(), Some(genesis_hash));
            let header = chain.get_header(&genesis_hash).unwrap().unwrap();
            assert_eq!(header.height, 0);
            assert_eq!(header.difficulty, 1);
            assert_eq!(header.already_generated_transactions, 1);
            let indices = chain
                .read_block_output_global_indices(&genesis_hash)
                .unwrap()
                .unwrap();
            assert_eq!(indices.len(), 1);
            assert!(!indices[0].is_empty());
        }
        // A second open finds the persisted tip instead of re-creating it.
        let chain = open_chain(store);
        assert_eq!(chain.tip_hash(), genesis_hash);
        assert_eq!(chain.tip_height(), 0);
    }

    #[test]
    fn test_medians_follow_genesis() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let chain = open_chain(store);
        let c = Currency::default();
        assert_eq!(chain.next_median_timestamp(), c.genesis_timestamp);
        assert_eq!(
            chain.next_median_capacity_vote(),
            c.block_capacity_vote_min as u64
        );
        assert_eq!(chain.effective_median_size(), c.minimum_size_median);
    }

    #[test]
    fn test_genesis_cannot_be_undone() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut chain = open_chain(store);
        let genesis =
            PreparedBlock::from_block(chain.currency().genesis_block().unwrap(), fast_hash)
                .unwrap();
        assert!(chain.undo_tip_block(&genesis).is_err());
    }

    #[test]
    fn test_add_block_requires_tip_parent() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut chain = open_chain(store);
        let mut block = chain.currency().genesis_block().unwrap();
        block.header.previous_block_hash = Hash([7u8; 32]);
        block.header.timestamp += 1;
        let pb = PreparedBlock::from_block(block, fast_hash).unwrap();
        let err = chain.add_block(&pb, pb.block.header.timestamp).unwrap_err();
        assert!(matches!(err, Error::Consensus(_)));
    }
}
