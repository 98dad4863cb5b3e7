//! Protocol rule table: versions, window sizes, the difficulty retarget,
//! the reward schedule and coinbase construction.

use crate::{Error, Result};
use quartz_core::extra;
use quartz_core::{
    Amount, Block, BlockOrTimestamp, BlockTemplate, CumulativeDifficulty, Difficulty, Hash,
    Height, PublicKey, Timestamp, Transaction, TransactionInput, TransactionOutput,
    TransactionPrefix, TransactionSignatures,
};

/// Compressed ed25519 basepoint, spendable by nobody in particular; the
/// destination of the genesis reward.
const GENESIS_OUTPUT_KEY: [u8; 32] = [
    0x58, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66,
];

/// Network rule table. All consensus-affecting constants live here so the
/// validator, replay engine, pool and template builder agree on them.
#[derive(Clone, Debug)]
pub struct Currency {
    /// Height at which the amethyst rules activate.
    pub amethyst_fork_height: Height,
    /// Blocks after activation during which the old major version is still
    /// accepted.
    pub fork_activation_window: Height,
    pub amethyst_block_version: u8,
    pub amethyst_transaction_version: u8,

    pub block_future_time_limit: Timestamp,
    pub timestamp_check_window: usize,
    pub median_block_size_window: usize,
    pub minimum_size_median: usize,
    pub block_capacity_vote_min: usize,
    pub block_capacity_vote_max: usize,
    pub max_header_size: usize,
    pub miner_tx_blob_reserved_size: usize,

    pub mined_money_unlock_window: Height,
    /// Unlock values below this are block heights, above are timestamps.
    pub max_block_height: Height,

    pub difficulty_target: Timestamp,
    pub difficulty_window: usize,
    pub difficulty_lag: usize,
    pub difficulty_cut: usize,

    pub money_supply: Amount,
    pub emission_speed_factor: u32,

    /// Below this height key images with a torsion component are accepted,
    /// matching the historical chain.
    pub key_image_subgroup_checking_height: Height,
    /// Sparse (height, hash) pairs; blocks at these heights must match
    /// exactly and the whole zone up to the last pair skips PoW.
    pub hard_checkpoints: Vec<(Height, Hash)>,

    pub genesis_timestamp: Timestamp,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            amethyst_fork_height: 100_000,
            fork_activation_window: 720,
            amethyst_block_version: 4,
            amethyst_transaction_version: 4,
            block_future_time_limit: 7_200,
            timestamp_check_window: 60,
            median_block_size_window: 100,
            minimum_size_median: 100_000,
            block_capacity_vote_min: 100_000,
            block_capacity_vote_max: 2_000_000,
            max_header_size: 2_048,
            miner_tx_blob_reserved_size: 600,
            mined_money_unlock_window: 10,
            max_block_height: 500_000_000,
            difficulty_target: 120,
            difficulty_window: 720,
            difficulty_lag: 15,
            difficulty_cut: 60,
            money_supply: u64::MAX,
            emission_speed_factor: 18,
            key_image_subgroup_checking_height: 100_000,
            hard_checkpoints: Vec::new(),
            genesis_timestamp: 1_443_286_948,
        }
    }
}

impl Currency {
    /// Major versions accepted at a height: the scheduled one, plus the
    /// previous one inside the activation window.
    pub fn expected_major_versions(&self, height: Height) -> (u8, u8) {
        if height < self.amethyst_fork_height {
            (1, 1)
        } else if height < self.amethyst_fork_height + self.fork_activation_window {
            (self.amethyst_block_version, 1)
        } else {
            (self.amethyst_block_version, self.amethyst_block_version)
        }
    }

    /// The major version a freshly built template should carry.
    pub fn major_version_for_height(&self, height: Height) -> u8 {
        if height >= self.amethyst_fork_height {
            self.amethyst_block_version
        } else {
            1
        }
    }

    pub fn is_amethyst(&self, block_major_version: u8) -> bool {
        block_major_version >= self.amethyst_block_version
    }

    pub fn is_transaction_version_allowed(&self, block_major_version: u8, version: u8) -> bool {
        version == 1
            || (version == self.amethyst_transaction_version
                && self.is_amethyst(block_major_version))
    }

    /// Pre-amethyst outputs must be a single decimal digit times a power of
    /// ten; amethyst allows arbitrary amounts.
    pub fn amount_allowed_in_output(&self, block_major_version: u8, amount: Amount) -> bool {
        if self.is_amethyst(block_major_version) {
            return true;
        }
        let mut a = amount;
        while a >= 10 && a % 10 == 0 {
            a /= 10;
        }
        (1..=9).contains(&a)
    }

    pub fn is_transaction_unlocked(
        &self,
        block_major_version: u8,
        unlock: BlockOrTimestamp,
        block_height: Height,
        block_timestamp: Timestamp,
        median_timestamp: Timestamp,
    ) -> bool {
        if unlock < u64::from(self.max_block_height) {
            return unlock <= u64::from(block_height);
        }
        // Amethyst anchors timestamp locks to the median so a single miner
        // cannot unlock early by skewing one timestamp.
        let now = if self.is_amethyst(block_major_version) {
            median_timestamp
        } else {
            block_timestamp
        };
        unlock <= now
    }

    pub fn max_block_transactions_cumulative_size(&self, height: Height) -> usize {
        std::cmp::min(8_000_000, 1_000_000 + height as usize * 100)
    }

    pub fn base_block_reward(&self, already_generated_coins: Amount) -> Amount {
        (self.money_supply - already_generated_coins) >> self.emission_speed_factor
    }

    /// Block reward and the amount by which it inflates the coin supply.
    ///
    /// Amethyst: reward = base + fees, only the base inflates. Pre-fork the
    /// base is penalized quadratically once the block grows past the
    /// effective size median.
    pub fn get_block_reward(
        &self,
        block_major_version: u8,
        effective_median_size: usize,
        current_block_size: usize,
        already_generated_coins: Amount,
        fee: Amount,
    ) -> Result<(Amount, Amount)> {
        let base_reward = self.base_block_reward(already_generated_coins);
        if self.is_amethyst(block_major_version) {
            return Ok((base_reward + fee, base_reward));
        }
        if current_block_size <= effective_median_size {
            return Ok((base_reward + fee, base_reward));
        }
        if current_block_size > 2 * effective_median_size {
            return Err(Error::Consensus(format!(
                "block size {} exceeds twice the effective median {}",
                current_block_size, effective_median_size
            )));
        }
        let median = effective_median_size as u128;
        let size = current_block_size as u128;
        // Factor (2*m*s - s^2) / m^2, full reward at the median and zero at
        // twice the median.
        let multiplicand = size * (2 * median - size);
        let penalized = (u128::from(base_reward) * multiplicand / (median * median)) as u64;
        Ok((penalized + fee, penalized))
    }

    /// Classic windowed retarget with outlier cut. The inputs are the last
    /// `window + lag` ancestor (timestamp, cumulative difficulty) pairs,
    /// oldest first.
    pub fn next_difficulty(
        &self,
        timestamps: &[Timestamp],
        cumulative_difficulties: &[CumulativeDifficulty],
    ) -> Difficulty {
        debug_assert_eq!(timestamps.len(), cumulative_difficulties.len());
        let take = std::cmp::min(timestamps.len(), self.difficulty_window);
        let mut timestamps: Vec<Timestamp> = timestamps[..take].to_vec();
        let difficulties = &cumulative_difficulties[..take];
        let length = timestamps.len();
        if length <= 1 {
            return 1;
        }
        timestamps.sort_unstable();
        let kept = self.difficulty_window - 2 * self.difficulty_cut;
        let (cut_begin, cut_end) = if length <= kept {
            (0, length)
        } else {
            let begin = (length - kept + 1) / 2;
            (begin, begin + kept)
        };
        let time_span = std::cmp::max(1, timestamps[cut_end - 1] - timestamps[cut_begin]);
        let total_work =
            u128::from(difficulties[cut_end - 1]) - u128::from(difficulties[cut_begin]);
        let guess = (total_work * u128::from(self.difficulty_target)
            + u128::from(time_span)
            - 1)
            / u128::from(time_span);
        std::cmp::max(1, guess as Difficulty)
    }

    pub fn hard_checkpoint_at(&self, height: Height) -> Option<&Hash> {
        self.hard_checkpoints
            .iter()
            .find(|(h, _)| *h == height)
            .map(|(_, hash)| hash)
    }

    pub fn is_in_hard_checkpoint_zone(&self, height: Height) -> bool {
        self.hard_checkpoints
            .last()
            .is_some_and(|(last, _)| height <= *last)
    }

    /// Splits an amount into protocol-rounded denominations, dust first.
    pub fn decompose_amount(&self, amount: Amount) -> Vec<Amount> {
        let mut parts = Vec::new();
        let mut rest = amount;
        let mut order: Amount = 1;
        while rest > 0 {
            let digit = rest % 10;
            if digit > 0 {
                parts.push(digit * order);
            }
            rest /= 10;
            order = order.saturating_mul(10);
        }
        parts
    }

    /// Builds the coinbase transaction for a template. The miner key is
    /// used directly for every output; one-time key derivation is the
    /// wallet's concern.
    pub fn construct_miner_tx(
        &self,
        block_major_version: u8,
        height: Height,
        reward: Amount,
        miner_public_key: PublicKey,
        extra_nonce: &[u8],
        capacity_vote: Option<u64>,
    ) -> Result<Transaction> {
        let amethyst = self.is_amethyst(block_major_version);
        let mut extra = Vec::new();
        if !extra_nonce.is_empty() {
            extra::add_nonce(&mut extra, extra_nonce);
        }
        if let Some(vote) = capacity_vote {
            extra::add_capacity_vote(&mut extra, vote);
        }
        let amounts = if amethyst {
            vec![reward]
        } else {
            self.decompose_amount(reward)
        };
        let outputs = amounts
            .into_iter()
            .map(|amount| TransactionOutput::Key {
                amount,
                public_key: miner_public_key,
                is_auditable: false,
            })
            .collect();
        Ok(Transaction {
            prefix: TransactionPrefix {
                version: if amethyst {
                    self.amethyst_transaction_version
                } else {
                    1
                },
                unlock_block_or_timestamp: u64::from(height)
                    + u64::from(self.mined_money_unlock_window),
                inputs: vec![TransactionInput::Coinbase { height }],
                outputs,
                extra,
            },
            signatures: TransactionSignatures::None,
        })
    }

    /// The deterministic first block of the chain.
    pub fn genesis_block(&self) -> Result<Block> {
        let reward = self.base_block_reward(0);
        let base_transaction =
            self.construct_miner_tx(1, 0, reward, PublicKey(GENESIS_OUTPUT_KEY), &[], None)?;
        Ok(Block {
            header: BlockTemplate {
                major_version: 1,
                minor_version: 0,
                timestamp: self.genesis_timestamp,
                previous_block_hash: Hash::ZERO,
                nonce: vec![0x42, 0, 0, 0],
                root_block: None,
                base_transaction,
                transaction_hashes: Vec::new(),
            },
            transactions: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_amounts_pre_fork() {
        let c = Currency::default();
        for amount in [1u64, 9, 50, 700, 90_000_000_000] {
            assert!(c.amount_allowed_in_output(1, amount), "{}", amount);
        }
        for amount in [0u64, 11, 25, 102, 6_299_999_999_000_000] {
            assert!(!c.amount_allowed_in_output(1, amount), "{}", amount);
        }
        assert!(c.amount_allowed_in_output(4, 6_299_999_999_000_000));
    }

    #[test]
    fn test_decompose_roundtrip() {
        let c = Currency::default();
        let parts = c.decompose_amount(10_203);
        assert_eq!(parts, vec![3, 200, 10_000]);
        assert!(parts
            .iter()
            .all(|&p| c.amount_allowed_in_output(1, p)));
        assert_eq!(parts.iter().sum::<Amount>(), 10_203);
        assert!(c.decompose_amount(0).is_empty());
    }

    #[test]
    fn test_unlock_threshold_selects_height_or_time() {
        let c = Currency::default();
        // Height-style lock.
        assert!(c.is_transaction_unlocked(1, 100, 100, 0, 0));
        assert!(!c.is_transaction_unlocked(1, 101, 100, 0, 0));
        // Timestamp-style lock uses the block time pre-fork.
        let t = u64::from(c.max_block_height) + 50;
        assert!(c.is_transaction_unlocked(1, t, 0, t, 0));
        assert!(!c.is_transaction_unlocked(1, t, 0, t - 1, t + 5));
        // Amethyst switches to the median timestamp.
        assert!(c.is_transaction_unlocked(4, t, 0, t - 1, t));
        assert!(!c.is_transaction_unlocked(4, t, 0, t + 5, t - 1));
    }

    #[test]
    fn test_reward_penalty_applies_above_median() {
        let c = Currency::default();
        let base = c.base_block_reward(0);
        let (full, emission) = c.get_block_reward(1, 100_000, 100_000, 0, 7).unwrap();
        assert_eq!(full, base + 7);
        assert_eq!(emission, base);
        let (penalized, pen_emission) =
            c.get_block_reward(1, 100_000, 150_000, 0, 7).unwrap();
        assert!(pen_emission < base);
        assert_eq!(penalized, pen_emission + 7);
        // At 1.5x the median the factor is exactly 3/4.
        assert_eq!(
            pen_emission,
            (u128::from(base) * 3 / 4) as u64
        );
        // The reward vanishes at twice the median and the size is rejected
        // one byte past it.
        let (_, zero_emission) = c.get_block_reward(1, 100_000, 200_000, 0, 0).unwrap();
        assert_eq!(zero_emission, 0);
        assert!(c.get_block_reward(1, 100_000, 200_001, 0, 0).is_err());
        // Amethyst never penalizes.
        let (am, am_emission) = c.get_block_reward(4, 100_000, 2_000_000, 0, 7).unwrap();
        assert_eq!(am, c.base_block_reward(0) + 7);
        assert_eq!(am_emission, c.base_block_reward(0));
    }

    #[test]
    fn test_difficulty_tracks_block_rate() {
        let c = Currency::default();
        // Blocks exactly on target keep difficulty stable.
        let n = 100;
        let timestamps: Vec<Timestamp> =
            (0..n).map(|i| i as Timestamp * c.difficulty_target).collect();
        let difficulties: Vec<CumulativeDifficulty> = (0..n).map(|i| 1000 * i as u64).collect();
        let d = c.next_difficulty(&timestamps, &difficulties);
        assert!((900..=1100).contains(&d), "{}", d);
        // Twice as fast doubles it.
        let fast: Vec<Timestamp> =
            (0..n).map(|i| i as Timestamp * c.difficulty_target / 2).collect();
        let d_fast = c.next_difficulty(&fast, &difficulties);
        assert!(d_fast > d * 3 / 2, "{} vs {}", d_fast, d);
        assert_eq!(c.next_difficulty(&[], &[]), 1);
        assert_eq!(c.next_difficulty(&[5], &[10]), 1);
    }

    #[test]
    fn test_version_windows() {
        let c = Currency::default();
        assert_eq!(c.expected_major_versions(0), (1, 1));
        let fork = c.amethyst_fork_height;
        assert_eq!(c.expected_major_versions(fork), (4, 1));
        assert_eq!(
            c.expected_major_versions(fork + c.fork_activation_window),
            (4, 4)
        );
    }

    #[test]
    fn test_genesis_is_stable() {
        let c = Currency::default();
        let a = c.genesis_block().unwrap();
        let b = c.genesis_block().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.header.base_transaction.prefix.inputs.len(), 1);
        assert!(a.header.base_transaction.is_coinbase());
    }
}
