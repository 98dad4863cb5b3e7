//! Fee-prioritized transaction pool with byte-budgeted admission.
//!
//! Policy refusals (duplicate, outbid, displaced) return `Ok(false)` so
//! relay code can drop a transaction without treating the peer as
//! misbehaving; validation failures are hard errors.

use crate::chain::BlockChainState;
use crate::replay::{self, RingChecker};
use crate::state::{ChainState, DeltaState};
use crate::validate::{transaction_key_images, validate_semantic};
use crate::{Error, Result};
use quartz_core::{to_binary, Amount, Hash, KeyImage, PreparedBlock, Timestamp, Transaction};
use quartz_cryptography::fast_hash;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// A transaction held in the pool, with everything admission decided on.
#[derive(Clone, Debug)]
pub struct PoolTransaction {
    pub tx: Transaction,
    pub binary: Vec<u8>,
    pub fee: Amount,
    /// Wall-clock receipt time, used for template insertion order.
    pub timestamp: Timestamp,
    /// Main-chain block holding the newest output any input references.
    /// When that block leaves the chain the transaction must revalidate.
    pub newest_referenced_block: Hash,
}

impl PoolTransaction {
    pub fn size(&self) -> usize {
        self.binary.len()
    }

    pub fn fee_per_byte(&self) -> Amount {
        self.fee / self.binary.len() as u64
    }
}

/// Pool entry summary served to syncing peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransactionDesc {
    pub hash: Hash,
    pub fee: Amount,
    pub size: u64,
    pub newest_referenced_block: Hash,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolStatistics {
    pub count: usize,
    pub total_size: usize,
    pub max_size: usize,
    pub version: u64,
    pub min_fee_per_byte: Amount,
}

/// The pool indexes: body by hash, claimed key images, and a fee-ordered
/// set whose first element is the cheapest entry.
pub(crate) struct TransactionPool {
    by_hash: HashMap<Hash, PoolTransaction>,
    by_key_image: HashMap<KeyImage, Hash>,
    by_fee_per_byte: BTreeSet<(Amount, Hash)>,
    total_size: usize,
    max_size: usize,
    version: u64,
}

impl TransactionPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_key_image: HashMap::new(),
            by_fee_per_byte: BTreeSet::new(),
            total_size: 0,
            max_size,
            version: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&PoolTransaction> {
        self.by_hash.get(hash)
    }

    pub fn key_image_holder(&self, key_image: &KeyImage) -> Option<Hash> {
        self.by_key_image.get(key_image).copied()
    }

    /// The (fee per byte, hash) of the cheapest entry.
    pub fn cheapest(&self) -> Option<(Amount, Hash)> {
        self.by_fee_per_byte.first().copied()
    }

    /// Entries ordered by receipt time, then hash for determinism.
    pub fn by_timestamp(&self) -> Vec<(Hash, &PoolTransaction)> {
        let mut entries: Vec<(Hash, &PoolTransaction)> =
            self.by_hash.iter().map(|(h, t)| (*h, t)).collect();
        entries.sort_by_key(|(hash, t)| (t.timestamp, *hash));
        entries
    }

    pub fn insert(&mut self, hash: Hash, entry: PoolTransaction) {
        for key_image in transaction_key_images(&entry.tx) {
            self.by_key_image.insert(key_image, hash);
        }
        self.by_fee_per_byte.insert((entry.fee_per_byte(), hash));
        self.total_size += entry.size();
        self.by_hash.insert(hash, entry);
        self.version += 1;
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<PoolTransaction> {
        let entry = self.by_hash.remove(hash)?;
        for key_image in transaction_key_images(&entry.tx) {
            if self.by_key_image.get(&key_image) == Some(hash) {
                self.by_key_image.remove(&key_image);
            }
        }
        self.by_fee_per_byte.remove(&(entry.fee_per_byte(), *hash));
        self.total_size -= entry.size();
        self.version += 1;
        Some(entry)
    }

    /// Evicts cheapest entries until the pool fits its byte budget. Fee
    /// ties go largest hash first, mirroring the admission tie-break, so a
    /// just-admitted smaller-hash entry never evicts itself.
    fn enforce_size(&mut self) {
        while self.total_size > self.max_size {
            let Some((min_fpb, _)) = self.cheapest() else {
                return;
            };
            let Some(&(_, hash)) = self
                .by_fee_per_byte
                .iter()
                .take_while(|(fpb, _)| *fpb == min_fpb)
                .last()
            else {
                return;
            };
            debug!(hash = %hash, "pool over budget, evicting cheapest");
            self.remove(&hash);
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            count: self.len(),
            total_size: self.total_size,
            max_size: self.max_size,
            version: self.version,
            min_fee_per_byte: self.cheapest().map_or(0, |(fpb, _)| fpb),
        }
    }
}

impl BlockChainState {
    /// Admits a transaction to the pool.
    ///
    /// `Ok(true)` means inserted; `Ok(false)` means refused by pool policy
    /// while remaining valid; `Err` means the transaction can never be
    /// accepted on the current chain.
    pub fn add_transaction(
        &mut self,
        tid: Hash,
        tx: Transaction,
        binary: Vec<u8>,
        timestamp: Timestamp,
    ) -> Result<bool> {
        if self.pool.contains(&tid) {
            return Ok(false);
        }
        let key_images = transaction_key_images(&tx);
        for key_image in &key_images {
            if let Some(conflict_height) = self.ledger.read_keyimage(key_image)? {
                return Err(Error::OutputSpent {
                    key_image: *key_image,
                    conflict_height,
                });
            }
        }
        let next_height = self.tip_height() + 1;
        let block_major_version = self.currency().major_version_for_height(next_height);
        let amethyst = self.currency().is_amethyst(block_major_version);
        let fee = validate_semantic(self.currency(), block_major_version, false, &tx, amethyst)?;
        let fee_per_byte = fee / binary.len() as u64;

        // Admission when the pool is at capacity: the incoming transaction
        // must outbid the cheapest entry, ties broken towards the smaller
        // hash.
        if self.pool.total_size() + binary.len() > self.pool.max_size {
            if let Some((min_fpb, min_hash)) = self.pool.cheapest() {
                if fee_per_byte < min_fpb || (fee_per_byte == min_fpb && tid > min_hash) {
                    return Ok(false);
                }
            }
        }

        // A pool conflict on a key image is only displaced by a strictly
        // better offer, or an equal one with the smaller hash.
        let mut displaced = Vec::new();
        for key_image in &key_images {
            if let Some(holder) = self.pool.key_image_holder(key_image) {
                let holder_entry = self
                    .pool
                    .get(&holder)
                    .ok_or_else(|| Error::Invariant(format!("pool index names {} twice", holder)))?;
                let holder_fpb = holder_entry.fee_per_byte();
                if fee_per_byte < holder_fpb || (fee_per_byte == holder_fpb && tid > holder) {
                    return Ok(false);
                }
                displaced.push(holder);
            }
        }

        // Stateful validation against a throwaway overlay of the ledger.
        let mut delta = DeltaState::new(
            &self.ledger,
            next_height,
            timestamp,
            self.next_median_timestamp(),
        );
        let mut checker = RingChecker::new();
        let result = replay::redo_transaction(
            self.currency(),
            block_major_version,
            &tx,
            &mut delta,
            Some(&mut checker),
        )?;
        checker.verify_all()?;
        drop(delta);

        let newest_referenced_block = self
            .hash_by_height(result.newest_referenced_height)?
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "referenced height {} has no main-chain block",
                    result.newest_referenced_height
                ))
            })?;

        for holder in displaced {
            debug!(hash = %holder, replacement = %tid, "displacing pool conflict");
            self.pool.remove(&holder);
        }
        self.pool.insert(
            tid,
            PoolTransaction {
                tx,
                binary,
                fee,
                timestamp,
                newest_referenced_block,
            },
        );
        self.pool.enforce_size();
        debug!(hash = %tid, fee, "transaction admitted to pool");
        Ok(true)
    }

    pub fn remove_from_pool(&mut self, hash: &Hash) -> Option<PoolTransaction> {
        self.pool.remove(hash)
    }

    /// Drops pool entries confirmed by an applied block, plus any entry
    /// whose key image the block just spent.
    pub(crate) fn remove_confirmed_transactions(&mut self, block: &PreparedBlock) {
        for hash in &block.block.header.transaction_hashes {
            self.pool.remove(hash);
        }
        for tx in &block.block.transactions {
            for key_image in transaction_key_images(tx) {
                if let Some(holder) = self.pool.key_image_holder(&key_image) {
                    debug!(hash = %holder, "evicting pool conflict of a confirmed spend");
                    self.pool.remove(&holder);
                }
            }
        }
    }

    /// Rebuilds the pool after the tip moved backwards: returned
    /// transactions and all current entries are re-admitted from scratch,
    /// silently dropping whatever no longer validates.
    pub fn on_reorganization(
        &mut self,
        undone_transactions: Vec<Transaction>,
        now: Timestamp,
    ) -> Result<()> {
        let mut candidates: Vec<(Hash, Transaction, Vec<u8>, Timestamp)> = Vec::new();
        for tx in undone_transactions {
            let binary = to_binary(&tx);
            candidates.push((fast_hash(&binary), tx, binary, now));
        }
        for (hash, entry) in std::mem::take(&mut self.pool.by_hash) {
            candidates.push((hash, entry.tx, entry.binary, entry.timestamp));
        }
        self.pool.by_key_image.clear();
        self.pool.by_fee_per_byte.clear();
        self.pool.total_size = 0;
        self.pool.version += 1;
        for (hash, tx, binary, timestamp) in candidates {
            match self.add_transaction(hash, tx, binary, timestamp) {
                Ok(_) => {}
                Err(err) => debug!(hash = %hash, %err, "dropping pool entry after reorganization"),
            }
        }
        Ok(())
    }

    /// Pool entries strictly between the cursors in descending
    /// (fee per byte, hash) order, at most `max_count` of them. Peers call
    /// this repeatedly, moving `from` down to the last entry received.
    pub fn sync_pool(
        &self,
        from: (Amount, Hash),
        to: (Amount, Hash),
        max_count: usize,
    ) -> Vec<TransactionDesc> {
        let mut descs = Vec::new();
        for &(fpb, hash) in self.pool.by_fee_per_byte.range(..from).rev() {
            if (fpb, hash) <= to || descs.len() >= max_count {
                break;
            }
            let Some(entry) = self.pool.get(&hash) else {
                continue;
            };
            descs.push(TransactionDesc {
                hash,
                fee: entry.fee,
                size: entry.size() as u64,
                newest_referenced_block: entry.newest_referenced_block,
            });
        }
        descs
    }

    /// What a new transaction must pay per byte to enter the pool.
    pub fn minimum_pool_fee_per_byte(&self, zero_if_not_full: bool) -> Amount {
        if zero_if_not_full && self.pool.total_size() < self.pool.max_size {
            return 0;
        }
        self.pool.cheapest().map_or(0, |(fpb, _)| fpb)
    }

    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    pub fn pool_transaction(&self, hash: &Hash) -> Option<&PoolTransaction> {
        self.pool.get(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Config;
    use crate::currency::Currency;
    use quartz_core::{
        EccScalar, PublicKey, TransactionInput, TransactionOutput, TransactionPrefix,
        TransactionSignatures,
    };
    use quartz_cryptography::{generate_key_image, generate_ring_signature, random_keypair};
    use quartz_persistence::{MemoryStore, Store};
    use std::sync::Arc;

    const AMOUNT: Amount = 1_000_000;

    fn test_chain(max_pool_size: usize) -> BlockChainState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        BlockChainState::new(store, Currency::default(), Config { max_pool_size }).unwrap()
    }

    /// Seeds unlocked outputs at height 0 so pool validation can reference
    /// the genesis block.
    fn seed_outputs(chain: &mut BlockChainState, count: usize) -> Vec<(PublicKey, EccScalar)> {
        let mut rng = rand::thread_rng();
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let (public, secret) = random_keypair(&mut rng);
            chain
                .ledger
                .push_amount_output(AMOUNT, 0, 0, public, false)
                .unwrap();
            keys.push((public, secret));
        }
        keys
    }

    /// A ring-1 spend of seeded output `index` paying `output_amounts`
    /// back, so the fee is the difference.
    fn spend(
        keys: &[(PublicKey, EccScalar)],
        index: usize,
        output_amounts: &[Amount],
    ) -> (Hash, Transaction, Vec<u8>) {
        let mut rng = rand::thread_rng();
        let (public, secret) = &keys[index];
        let key_image = generate_key_image(public, secret).unwrap();
        let prefix = TransactionPrefix {
            version: 1,
            unlock_block_or_timestamp: 0,
            inputs: vec![TransactionInput::Key {
                amount: AMOUNT,
                output_offsets: vec![index as u64],
                key_image,
            }],
            outputs: output_amounts
                .iter()
                .map(|&amount| TransactionOutput::Key {
                    amount,
                    public_key: random_keypair(&mut rng).0,
                    is_auditable: false,
                })
                .collect(),
            extra: Vec::new(),
        };
        let prefix_hash = fast_hash(&to_binary(&prefix));
        let signatures =
            generate_ring_signature(&prefix_hash, &key_image, &[*public], secret, 0, &mut rng)
                .unwrap();
        let tx = Transaction {
            prefix,
            signatures: TransactionSignatures::Ring(vec![signatures]),
        };
        let binary = to_binary(&tx);
        (fast_hash(&binary), tx, binary)
    }

    #[test]
    fn test_admission_and_duplicate() {
        let mut chain = test_chain(1_000_000);
        let keys = seed_outputs(&mut chain, 1);
        let (tid, tx, binary) = spend(&keys, 0, &[900_000]);
        assert!(chain.add_transaction(tid, tx.clone(), binary.clone(), 5).unwrap());
        assert_eq!(chain.pool.len(), 1);
        let version = chain.pool.version();
        // A second submission is an idempotent no-op.
        assert!(!chain.add_transaction(tid, tx, binary, 6).unwrap());
        assert_eq!(chain.pool.version(), version);
    }

    #[test]
    fn test_confirmed_key_image_is_hard_error() {
        let mut chain = test_chain(1_000_000);
        let keys = seed_outputs(&mut chain, 1);
        let (public, secret) = &keys[0];
        let key_image = generate_key_image(public, secret).unwrap();
        chain.ledger.store_keyimage(&key_image, 0).unwrap();
        let (tid, tx, binary) = spend(&keys, 0, &[900_000]);
        let err = chain.add_transaction(tid, tx, binary, 5).unwrap_err();
        assert!(matches!(err, Error::OutputSpent { .. }));
    }

    #[test]
    fn test_full_pool_eviction_keeps_best_payers() {
        let mut chain = test_chain(0);
        let keys = seed_outputs(&mut chain, 2);
        let (tid_cheap, tx_cheap, binary_cheap) = spend(&keys, 0, &[900_000]);
        let size = binary_cheap.len();
        // Budget fits exactly one transaction.
        chain.pool.max_size = size;
        assert!(chain.add_transaction(tid_cheap, tx_cheap, binary_cheap, 5).unwrap());

        // A better fee per byte pushes the cheap entry out.
        let (tid_rich, tx_rich, binary_rich) = spend(&keys, 1, &[700_000]);
        assert!(chain.add_transaction(tid_rich, tx_rich, binary_rich, 6).unwrap());
        assert_eq!(chain.pool.len(), 1);
        assert!(chain.pool.contains(&tid_rich));
        assert!(!chain.pool.contains(&tid_cheap));
        assert_eq!(chain.pool.total_size(), size);
    }

    #[test]
    fn test_full_pool_rejects_underbidder() {
        let mut chain = test_chain(0);
        let keys = seed_outputs(&mut chain, 2);
        let (tid_rich, tx_rich, binary_rich) = spend(&keys, 0, &[700_000]);
        chain.pool.max_size = binary_rich.len();
        assert!(chain.add_transaction(tid_rich, tx_rich, binary_rich, 5).unwrap());

        let (tid_cheap, tx_cheap, binary_cheap) = spend(&keys, 1, &[900_000]);
        assert!(!chain.add_transaction(tid_cheap, tx_cheap, binary_cheap, 6).unwrap());
        assert!(chain.pool.contains(&tid_rich));
        assert_eq!(chain.pool.len(), 1);
    }

    #[test]
    fn test_key_image_displacement_needs_higher_fee() {
        let mut chain = test_chain(1_000_000);
        let keys = seed_outputs(&mut chain, 1);
        let (tid_a, tx_a, binary_a) = spend(&keys, 0, &[900_000]);
        assert!(chain.add_transaction(tid_a, tx_a, binary_a, 5).unwrap());

        // Same key image, lower fee per byte: refused.
        let (tid_low, tx_low, binary_low) = spend(&keys, 0, &[900_000, 50_000]);
        assert!(!chain.add_transaction(tid_low, tx_low, binary_low, 6).unwrap());
        assert!(chain.pool.contains(&tid_a));

        // Same key image, higher fee: displaces the incumbent.
        let (tid_high, tx_high, binary_high) = spend(&keys, 0, &[800_000]);
        assert!(chain.add_transaction(tid_high, tx_high, binary_high, 7).unwrap());
        assert!(!chain.pool.contains(&tid_a));
        assert!(chain.pool.contains(&tid_high));
        assert_eq!(chain.pool.len(), 1);
    }

    #[test]
    fn test_sync_pool_descends_by_fee() {
        let mut chain = test_chain(1_000_000);
        let keys = seed_outputs(&mut chain, 3);
        let mut tids = Vec::new();
        for (i, output_amount) in [900_000, 700_000, 800_000].into_iter().enumerate() {
            let (tid, tx, binary) = spend(&keys, i, &[output_amount]);
            assert!(chain.add_transaction(tid, tx, binary, 5 + i as u64).unwrap());
            tids.push(tid);
        }
        let from = (Amount::MAX, Hash([0xff; 32]));
        let to = (0, Hash::ZERO);
        let descs = chain.sync_pool(from, to, 10);
        assert_eq!(descs.len(), 3);
        let fees: Vec<Amount> = descs.iter().map(|d| d.fee).collect();
        assert_eq!(fees, vec![300_000, 200_000, 100_000]);
        // The cursor resumes below the last entry received.
        let first = chain.sync_pool(from, to, 1);
        assert_eq!(first.len(), 1);
        let entry = chain.pool.get(&first[0].hash).unwrap();
        let resumed = chain.sync_pool((entry.fee_per_byte(), first[0].hash), to, 10);
        assert_eq!(resumed.len(), 2);
    }

    #[test]
    fn test_minimum_fee_per_byte() {
        let mut chain = test_chain(1_000_000);
        assert_eq!(chain.minimum_pool_fee_per_byte(true), 0);
        let keys = seed_outputs(&mut chain, 1);
        let (tid, tx, binary) = spend(&keys, 0, &[900_000]);
        let size = binary.len() as u64;
        assert!(chain.add_transaction(tid, tx, binary, 5).unwrap());
        assert_eq!(chain.minimum_pool_fee_per_byte(true), 0);
        assert_eq!(chain.minimum_pool_fee_per_byte(false), 100_000 / size);
    }

    #[test]
    fn test_fee_tie_eviction_prefers_larger_hash() {
        let mut chain = test_chain(0);
        let keys = seed_outputs(&mut chain, 2);
        let mut a = spend(&keys, 0, &[900_000]);
        let mut b = spend(&keys, 1, &[900_000]);
        // Same fee and size, so the hashes alone decide; make `a` the
        // larger one.
        if a.0 < b.0 {
            std::mem::swap(&mut a, &mut b);
        }
        let (tid_large, tx_large, binary_large) = a;
        let (tid_small, tx_small, binary_small) = b;
        assert_eq!(binary_large.len(), binary_small.len());
        chain.pool.max_size = binary_large.len();
        assert!(chain.add_transaction(tid_large, tx_large, binary_large, 5).unwrap());

        // An equal fee per byte with the smaller hash wins the slot, and
        // the size cap must trim the incumbent, not the newcomer.
        assert!(chain.add_transaction(tid_small, tx_small, binary_small, 6).unwrap());
        assert!(chain.pool.contains(&tid_small));
        assert!(!chain.pool.contains(&tid_large));
        assert_eq!(chain.pool.len(), 1);
    }

    #[test]
    fn test_reorganization_revalidates_pool() {
        let mut chain = test_chain(1_000_000);
        let keys = seed_outputs(&mut chain, 1);
        let (tid, tx, binary) = spend(&keys, 0, &[900_000]);
        assert!(chain.add_transaction(tid, tx, binary, 5).unwrap());
        chain.on_reorganization(Vec::new(), 6).unwrap();
        assert!(chain.pool.contains(&tid));
        assert_eq!(chain.pool.len(), 1);
    }
}
