//! Stateless transaction validation and the standalone block checks that
//! run before replay touches the ledger.

use crate::chain::{BlockChainState, BlockHeaderInfo};
use crate::currency::Currency;
use crate::{Error, Result};
use quartz_core::{
    extra, relative_offsets_to_absolute, to_binary, Amount, KeyImage, PreparedBlock, Timestamp,
    TransactionInput, TransactionOutput,
};
use quartz_core::Transaction;
use quartz_cryptography::{check_hash, key_is_valid, slow_hash, tree_hash_from_branch};
use std::collections::HashSet;

/// Deepest merge-mining branch accepted, bounding chains of 2^256 leaves.
const MAX_MERGE_MINING_DEPTH: u64 = 8 * 32;

/// Context-free transaction checks: structure, versions, amounts and
/// input uniqueness. Returns the fee, or the output sum for a coinbase
/// transaction (`generating`).
pub fn validate_semantic(
    currency: &Currency,
    block_major_version: u8,
    generating: bool,
    tx: &Transaction,
    check_output_key: bool,
) -> Result<Amount> {
    if tx.prefix.inputs.is_empty() {
        return Err(Error::Consensus("transaction has no inputs".into()));
    }
    if !currency.is_transaction_version_allowed(block_major_version, tx.prefix.version) {
        return Err(Error::Consensus(format!(
            "transaction version {} not allowed under block version {}",
            tx.prefix.version, block_major_version
        )));
    }
    extra::check_extra(&tx.prefix.extra)
        .map_err(|e| Error::Consensus(format!("malformed extra field: {}", e)))?;

    let mut outputs_sum: Amount = 0;
    for output in &tx.prefix.outputs {
        let TransactionOutput::Key {
            amount,
            public_key,
            is_auditable,
        } = output;
        if *amount == 0 {
            return Err(Error::Consensus("output of zero amount".into()));
        }
        if !currency.amount_allowed_in_output(block_major_version, *amount) {
            return Err(Error::Consensus(format!(
                "output amount {} is not protocol-rounded",
                amount
            )));
        }
        if *is_auditable && tx.prefix.version < currency.amethyst_transaction_version {
            return Err(Error::Consensus(
                "auditable output in a legacy-version transaction".into(),
            ));
        }
        if check_output_key && !key_is_valid(public_key) {
            return Err(Error::Consensus(format!(
                "output public key {} is not a valid curve point",
                public_key
            )));
        }
        outputs_sum = outputs_sum
            .checked_add(*amount)
            .ok_or_else(|| Error::Consensus("output amounts overflow".into()))?;
    }

    let mut inputs_sum: Amount = 0;
    let mut key_images = HashSet::new();
    for input in &tx.prefix.inputs {
        match input {
            TransactionInput::Coinbase { .. } => {
                if !generating {
                    return Err(Error::Consensus(
                        "coinbase input outside the base transaction".into(),
                    ));
                }
                if tx.prefix.inputs.len() != 1 {
                    return Err(Error::Consensus(
                        "base transaction must have exactly one input".into(),
                    ));
                }
            }
            TransactionInput::Key {
                amount,
                output_offsets,
                key_image,
            } => {
                if generating {
                    return Err(Error::Consensus(
                        "key input in the base transaction".into(),
                    ));
                }
                if relative_offsets_to_absolute(output_offsets).is_none() {
                    return Err(Error::Consensus(
                        "input has empty or non-increasing output offsets".into(),
                    ));
                }
                if !key_images.insert(*key_image) {
                    return Err(Error::Consensus(format!(
                        "key image {} referenced twice",
                        key_image
                    )));
                }
                inputs_sum = inputs_sum
                    .checked_add(*amount)
                    .ok_or_else(|| Error::Consensus("input amounts overflow".into()))?;
            }
        }
    }

    if generating {
        return Ok(outputs_sum);
    }
    if outputs_sum > inputs_sum {
        return Err(Error::Consensus(format!(
            "outputs {} exceed inputs {}",
            outputs_sum, inputs_sum
        )));
    }
    Ok(inputs_sum - outputs_sum)
}

/// Key images of all key inputs, in input order.
pub(crate) fn transaction_key_images(tx: &Transaction) -> Vec<KeyImage> {
    tx.prefix
        .inputs
        .iter()
        .filter_map(|input| match input {
            TransactionInput::Key { key_image, .. } => Some(*key_image),
            TransactionInput::Coinbase { .. } => None,
        })
        .collect()
}

impl BlockChainState {
    /// All consensus checks that need only the parent header and the tip
    /// medians. On success returns the fully filled header info for the
    /// block; replay then enforces the stateful rules.
    pub(crate) fn check_standalone_consensus(
        &self,
        block: &PreparedBlock,
        prev_info: &BlockHeaderInfo,
        now: Timestamp,
    ) -> Result<BlockHeaderInfo> {
        let currency = self.currency();
        let header = &block.block.header;
        let height = prev_info.height + 1;

        let timestamp_median = self.next_median_timestamp();
        if header.timestamp < timestamp_median {
            return Err(Error::Consensus(format!(
                "timestamp {} is below the median {}",
                header.timestamp, timestamp_median
            )));
        }
        if header.timestamp > now + currency.block_future_time_limit {
            return Err(Error::Consensus(format!(
                "timestamp {} is too far in the future",
                header.timestamp
            )));
        }

        let (expected, previous) = currency.expected_major_versions(height);
        if header.major_version != expected && header.major_version != previous {
            return Err(Error::Consensus(format!(
                "major version {} not accepted at height {}",
                header.major_version, height
            )));
        }
        let amethyst = currency.is_amethyst(header.major_version);

        if block.header_size > currency.max_header_size {
            return Err(Error::Consensus(format!(
                "header size {} exceeds the limit {}",
                block.header_size, currency.max_header_size
            )));
        }

        let transactions_size = block.coinbase_tx_size
            + block
                .raw_block
                .transactions
                .iter()
                .map(Vec::len)
                .sum::<usize>();
        let block_size = block.header_size + transactions_size;

        let block_capacity_vote = if amethyst {
            let vote = extra::get_capacity_vote(&header.base_transaction.prefix.extra)
                .ok_or_else(|| {
                    Error::Consensus("base transaction carries no capacity vote".into())
                })?;
            if vote < currency.block_capacity_vote_min as u64
                || vote > currency.block_capacity_vote_max as u64
            {
                return Err(Error::Consensus(format!(
                    "capacity vote {} outside the allowed range",
                    vote
                )));
            }
            let capacity = self.next_median_capacity_vote();
            if transactions_size as u64 > capacity {
                return Err(Error::Consensus(format!(
                    "transactions size {} exceeds the voted capacity {}",
                    transactions_size, capacity
                )));
            }
            Some(vote)
        } else {
            if transactions_size > 2 * self.effective_median_size() {
                return Err(Error::Consensus(format!(
                    "transactions size {} exceeds twice the effective median",
                    transactions_size
                )));
            }
            if transactions_size > currency.max_block_transactions_cumulative_size(height) {
                return Err(Error::Consensus(format!(
                    "transactions size {} exceeds the height-scaled limit",
                    transactions_size
                )));
            }
            None
        };

        if let Some(root_block) = &header.root_block {
            let tag = extra::get_merge_mining_tag(&root_block.base_transaction.prefix.extra)
                .ok_or_else(|| {
                    Error::Consensus("merge-mined block carries no merge-mining tag".into())
                })?;
            if tag.depth != root_block.blockchain_branch.len() as u64
                || tag.depth > MAX_MERGE_MINING_DEPTH
            {
                return Err(Error::Consensus(format!(
                    "merge-mining depth {} does not match branch length {}",
                    tag.depth,
                    root_block.blockchain_branch.len()
                )));
            }
            if root_block.base_transaction_branch.len() as u64 > MAX_MERGE_MINING_DEPTH {
                return Err(Error::Consensus("root transaction branch too deep".into()));
            }
            if tree_hash_from_branch(&root_block.blockchain_branch, &block.hash) != tag.merkle_root
            {
                return Err(Error::Consensus(
                    "merge-mining branch does not prove this block".into(),
                ));
            }
        }

        let (timestamps, difficulties) = self.difficulty_inputs(prev_info)?;
        let difficulty = currency.next_difficulty(&timestamps, &difficulties);

        match &header.base_transaction.prefix.inputs[..] {
            [TransactionInput::Coinbase { height: h }] if *h == height => {}
            _ => {
                return Err(Error::Consensus(
                    "base transaction does not carry this block's height".into(),
                ))
            }
        }
        if !amethyst {
            let expected_unlock =
                u64::from(height) + u64::from(currency.mined_money_unlock_window);
            if header.base_transaction.prefix.unlock_block_or_timestamp != expected_unlock {
                return Err(Error::Consensus(format!(
                    "base transaction unlock {} differs from the mandated {}",
                    header.base_transaction.prefix.unlock_block_or_timestamp, expected_unlock
                )));
            }
        }

        let coinbase_outputs = validate_semantic(
            currency,
            header.major_version,
            true,
            &header.base_transaction,
            amethyst,
        )?;
        let mut transactions_fee: Amount = 0;
        for tx in &block.block.transactions {
            let fee = validate_semantic(currency, header.major_version, false, tx, amethyst)?;
            transactions_fee = transactions_fee
                .checked_add(fee)
                .ok_or_else(|| Error::Consensus("block fees overflow".into()))?;
        }

        let (reward, emission) = currency.get_block_reward(
            header.major_version,
            self.effective_median_size(),
            transactions_size,
            prev_info.already_generated_coins,
            transactions_fee,
        )?;
        if coinbase_outputs != reward {
            return Err(Error::Consensus(format!(
                "coinbase pays {} but the block reward is {}",
                coinbase_outputs, reward
            )));
        }

        if let Some(checkpoint) = currency.hard_checkpoint_at(height) {
            if block.hash != *checkpoint {
                return Err(Error::Consensus(format!(
                    "block {} does not match the checkpoint at height {}",
                    block.hash, height
                )));
            }
        } else if !currency.is_in_hard_checkpoint_zone(height) {
            let long_hash = match block.long_hash {
                Some(hash) => hash,
                None => match &header.root_block {
                    Some(root_block) => slow_hash(&to_binary(root_block)),
                    None => slow_hash(&block.raw_block.block),
                },
            };
            if !check_hash(&long_hash, difficulty) {
                return Err(Error::Consensus(format!(
                    "proof of work does not meet difficulty {}",
                    difficulty
                )));
            }
        }

        Ok(BlockHeaderInfo {
            hash: block.hash,
            height,
            major_version: header.major_version,
            minor_version: header.minor_version,
            timestamp: header.timestamp,
            previous_block_hash: header.previous_block_hash,
            binary_nonce: header.nonce.clone(),
            timestamp_median,
            block_size,
            transactions_size,
            base_reward: emission,
            reward,
            already_generated_coins: prev_info.already_generated_coins + emission,
            already_generated_transactions: prev_info.already_generated_transactions
                + block.block.transactions.len() as u64
                + 1,
            difficulty,
            cumulative_difficulty: prev_info.cumulative_difficulty + difficulty,
            transactions_fee,
            block_capacity_vote,
        })
    }
}
