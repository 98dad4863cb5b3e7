//! Block template construction for miners and re-assembly of mined
//! templates into full blocks.

use crate::chain::{BlockChainState, BlockHeaderInfo};
use crate::replay;
use crate::state::DeltaState;
use crate::{Error, Result};
use quartz_core::{
    binary_size, extra, from_binary, Amount, BlockTemplate, Difficulty, Height, PreparedBlock,
    PublicKey, RawBlock, Timestamp,
};
use quartz_cryptography::fast_hash;
use tracing::debug;

/// Coinbase size/reward fixup attempts before giving up on a template.
const TRIES_COUNT: usize = 11;

/// Templates stay redeemable for this many blocks after they were built.
const MINING_MEMORY_BLOCKS: Height = 10;

/// A transaction only argues for more block capacity when it pays at
/// least this much per byte.
const VOTE_FEE_PER_BYTE_THRESHOLD: Amount = 100;

/// What a miner needs to start searching nonces.
#[derive(Clone, Debug)]
pub struct MiningTemplate {
    pub block: BlockTemplate,
    pub difficulty: Difficulty,
    pub height: Height,
}

impl BlockChainState {
    /// Builds a block template on the current tip: pool transactions are
    /// taken in receipt order while they fit the size budget and still
    /// replay cleanly, then the coinbase is sized to match its own reward.
    pub fn create_mining_block_template(
        &mut self,
        miner_public_key: PublicKey,
        extra_nonce: &[u8],
        now: Timestamp,
    ) -> Result<MiningTemplate> {
        let tip = self.tip().clone();
        let height = tip.height + 1;
        let major_version = self.currency().major_version_for_height(height);
        let amethyst = self.currency().is_amethyst(major_version);
        let (timestamps, difficulties) = self.difficulty_inputs(&tip)?;
        let difficulty = self.currency().next_difficulty(&timestamps, &difficulties);
        let timestamp = std::cmp::max(now, self.next_median_timestamp());

        let reserved = self.currency().miner_tx_blob_reserved_size;
        let capacity = if amethyst {
            self.next_median_capacity_vote() as usize
        } else {
            self.effective_median_size()
        };
        let budget = capacity.saturating_sub(reserved);

        let mut delta = DeltaState::new(
            &self.ledger,
            height,
            timestamp,
            self.next_median_timestamp(),
        );
        let mut transaction_hashes = Vec::new();
        let mut included = Vec::new();
        let mut transactions_size = 0usize;
        let mut transactions_fee: Amount = 0;
        for (hash, entry) in self.pool.by_timestamp() {
            if transactions_size + entry.size() > budget {
                continue;
            }
            // Signatures were checked at admission; replay re-checks the
            // stateful rules against what the template spends so far.
            match replay::redo_transaction(
                self.currency(),
                major_version,
                &entry.tx,
                &mut delta,
                None,
            ) {
                Ok(_) => {
                    transactions_size += entry.size();
                    transactions_fee += entry.fee;
                    transaction_hashes.push(hash);
                    included.push((hash, entry.binary.clone()));
                }
                Err(err) => {
                    debug!(hash = %hash, %err, "pool transaction left out of template");
                }
            }
        }
        drop(delta);
        for (hash, binary) in included {
            self.mining_transactions.insert(hash, (binary, tip.height));
        }

        let capacity_vote = if amethyst {
            let vote_min = self.currency().block_capacity_vote_min as u64;
            let vote_max = self.currency().block_capacity_vote_max as u64;
            let well_paid: u64 = self
                .pool
                .by_timestamp()
                .iter()
                .filter(|(_, t)| t.fee_per_byte() >= VOTE_FEE_PER_BYTE_THRESHOLD)
                .map(|(_, t)| t.size() as u64)
                .sum();
            // Vote for the well-paid backlog plus some room for cheaper
            // transactions.
            Some((well_paid + vote_min / 2).clamp(vote_min, vote_max))
        } else {
            None
        };

        // The coinbase size feeds the reward and the reward feeds the
        // coinbase size; iterate until the guess is consistent, padding the
        // extra field when the final build comes in short.
        let mut size_guess = reserved;
        let mut base_transaction = None;
        for _ in 0..TRIES_COUNT {
            let (reward, _) = self.currency().get_block_reward(
                major_version,
                self.effective_median_size(),
                transactions_size + size_guess,
                tip.already_generated_coins,
                transactions_fee,
            )?;
            let mut candidate = self.currency().construct_miner_tx(
                major_version,
                height,
                reward,
                miner_public_key,
                extra_nonce,
                capacity_vote,
            )?;
            let actual = binary_size(&candidate);
            if actual == size_guess {
                base_transaction = Some(candidate);
                break;
            }
            if actual < size_guess {
                extra::add_padding(&mut candidate.prefix.extra, size_guess - actual);
                if binary_size(&candidate) != size_guess {
                    return Err(Error::Invariant(
                        "coinbase padding did not land on the target size".into(),
                    ));
                }
                base_transaction = Some(candidate);
                break;
            }
            size_guess = actual;
        }
        let base_transaction = base_transaction.ok_or_else(|| {
            Error::Invariant("coinbase size did not converge".into())
        })?;

        let block = BlockTemplate {
            major_version,
            minor_version: 0,
            timestamp,
            previous_block_hash: tip.hash,
            nonce: vec![0, 0, 0, 0],
            root_block: None,
            base_transaction,
            transaction_hashes,
        };
        debug!(
            height,
            difficulty,
            transactions = block.transaction_hashes.len(),
            "mining template built"
        );
        Ok(MiningTemplate {
            block,
            difficulty,
            height,
        })
    }

    /// Reassembles a mined template into a full block and submits it. The
    /// transaction bodies come from the pool or from the template memory.
    pub fn add_mined_block(
        &mut self,
        template_binary: Vec<u8>,
        now: Timestamp,
    ) -> Result<BlockHeaderInfo> {
        let header: BlockTemplate = from_binary(&template_binary)?;
        let mut transactions = Vec::with_capacity(header.transaction_hashes.len());
        for hash in &header.transaction_hashes {
            let binary = if let Some(entry) = self.pool.get(hash) {
                entry.binary.clone()
            } else if let Some((binary, _)) = self.mining_transactions.get(hash) {
                binary.clone()
            } else {
                return Err(Error::Consensus(format!(
                    "mined block lists unknown transaction {}",
                    hash
                )));
            };
            transactions.push(binary);
        }
        let raw_block = RawBlock {
            block: template_binary,
            transactions,
        };
        let block = PreparedBlock::prepare(raw_block, fast_hash)?;
        self.add_block(&block, now)
    }

    /// Forgets remembered template transactions that can no longer appear
    /// in a redeemable template.
    pub(crate) fn prune_mining_transactions(&mut self) {
        let tip_height = self.tip_height();
        self.mining_transactions
            .retain(|_, (_, height)| *height + MINING_MEMORY_BLOCKS >= tip_height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Config;
    use crate::currency::Currency;
    use quartz_core::{to_binary, Hash};
    use quartz_persistence::{MemoryStore, Store};
    use std::sync::Arc;

    fn test_chain() -> BlockChainState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        BlockChainState::new(store, Currency::default(), Config::default()).unwrap()
    }

    #[test]
    fn test_empty_template_mines_and_applies() {
        let mut chain = test_chain();
        let now = chain.tip().timestamp + chain.currency().difficulty_target;
        let template = chain
            .create_mining_block_template(PublicKey([3u8; 32]), b"nonce", now)
            .unwrap();
        assert_eq!(template.height, 1);
        assert_eq!(template.difficulty, 1);
        assert!(template.block.transaction_hashes.is_empty());
        let info = chain
            .add_mined_block(to_binary(&template.block), now)
            .unwrap();
        assert_eq!(info.height, 1);
        assert_eq!(chain.tip_height(), 1);
    }

    #[test]
    fn test_mined_block_with_unknown_transaction_rejected() {
        let mut chain = test_chain();
        let now = chain.tip().timestamp + 120;
        let mut template = chain
            .create_mining_block_template(PublicKey([3u8; 32]), &[], now)
            .unwrap();
        template.block.transaction_hashes.push(Hash([9u8; 32]));
        let err = chain
            .add_mined_block(to_binary(&template.block), now)
            .unwrap_err();
        assert!(err.to_string().contains("unknown transaction"), "{err}");
    }

    #[test]
    fn test_mining_memory_is_pruned() {
        let mut chain = test_chain();
        chain
            .mining_transactions
            .insert(Hash([1u8; 32]), (vec![1, 2, 3], 0));
        chain.prune_mining_transactions();
        assert_eq!(chain.mining_transactions.len(), 1);
        // Entries fall out once the tip has moved past the memory window.
        chain
            .mining_transactions
            .insert(Hash([2u8; 32]), (vec![4], 0));
        let mut now = chain.tip().timestamp;
        for _ in 0..12 {
            now += chain.currency().difficulty_target;
            let template = chain
                .create_mining_block_template(PublicKey([3u8; 32]), &[], now)
                .unwrap();
            chain.add_mined_block(to_binary(&template.block), now).unwrap();
        }
        assert!(chain.mining_transactions.is_empty());
    }
}
