//! Layered chain state: the persistent output/key-image ledger and the
//! in-memory delta overlay used for speculative application.

use crate::{invariant, Result};
use quartz_core::{
    from_binary, to_binary, varint, Amount, BlockOrTimestamp, Hash, Height, KeyImage, PublicKey,
    Timestamp,
};
use quartz_persistence::{SeekDirection, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Storage key layout. Ordered varints keep per-amount outputs and
/// spend-chain records scannable in index order.
pub(crate) mod keys {
    use super::*;

    pub const KEY_IMAGE_PREFIX: u8 = b'i';
    pub const OUTPUT_PREFIX: u8 = b'a';
    pub const BLOCK_GLOBAL_INDICES_PREFIX: u8 = b'b';
    pub const BLOCK_GLOBAL_INDICES_SUFFIX: u8 = b'g';
    pub const SPEND_CHAIN_PREFIX: u8 = b'D';
    pub const HEADER_PREFIX: u8 = b'c';
    pub const HEIGHT_INDEX_PREFIX: u8 = b'h';
    pub const TIP_KEY: &[u8] = b"$tip";
    pub const VERSION_KEY: &[u8] = b"$version";

    pub fn key_image(key_image: &KeyImage) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(KEY_IMAGE_PREFIX);
        key.extend_from_slice(key_image.as_bytes());
        key
    }

    pub fn output_amount_prefix(amount: Amount) -> Vec<u8> {
        let mut key = vec![OUTPUT_PREFIX];
        varint::write_ordered(amount, &mut key);
        key
    }

    pub fn output(amount: Amount, global_index: u64) -> Vec<u8> {
        let mut key = output_amount_prefix(amount);
        varint::write_ordered(global_index, &mut key);
        key
    }

    pub fn block_global_indices(block_hash: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(34);
        key.push(BLOCK_GLOBAL_INDICES_PREFIX);
        key.extend_from_slice(block_hash.as_bytes());
        key.push(BLOCK_GLOBAL_INDICES_SUFFIX);
        key
    }

    pub fn spend_chain(record_id: u64) -> Vec<u8> {
        let mut key = vec![SPEND_CHAIN_PREFIX];
        varint::write_ordered(record_id, &mut key);
        key
    }

    pub fn header(block_hash: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(HEADER_PREFIX);
        key.extend_from_slice(block_hash.as_bytes());
        key
    }

    pub fn height_index(height: Height) -> Vec<u8> {
        let mut key = vec![HEIGHT_INDEX_PREFIX];
        varint::write_ordered(u64::from(height), &mut key);
        key
    }
}

/// Persisted per (amount, global index). The `dins` list names every
/// spend-chain record still holding this output as a live candidate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub unlock_block_or_timestamp: BlockOrTimestamp,
    pub public_key: PublicKey,
    pub height: Height,
    pub is_auditable: bool,
    pub spent: u8,
    pub dins: Vec<u64>,
}

/// The view shared by the persistent ledger and delta overlays.
///
/// A key image exists in at most one layer of the visible chain; callers
/// check `read_keyimage` before `store_keyimage`, which fails loudly on a
/// local duplicate.
pub trait ChainState {
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height) -> Result<()>;

    fn delete_keyimage(&mut self, key_image: &KeyImage) -> Result<()>;

    fn read_keyimage(&self, key_image: &KeyImage) -> Result<Option<Height>>;

    /// Appends an output for the amount and returns its global index.
    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        height: Height,
        public_key: PublicKey,
        is_auditable: bool,
    ) -> Result<u64>;

    /// Removes the newest output for the amount; the caller must supply the
    /// exact triple it was created with.
    fn pop_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        public_key: &PublicKey,
        is_auditable: bool,
    ) -> Result<()>;

    fn next_global_index_for_amount(&self, amount: Amount) -> Result<u64>;

    fn read_amount_output(&self, amount: Amount, global_index: u64) -> Result<Option<OutputRecord>>;
}

/// The persistent ledger over an ordered store.
pub struct LedgerState {
    pub(crate) store: Arc<dyn Store>,
    next_global_index: RwLock<HashMap<Amount, u64>>,
    pub(crate) next_spend_chain_id: u64,
}

impl LedgerState {
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let mut next_spend_chain_id = 0;
        store.for_each_prefix(
            &[keys::SPEND_CHAIN_PREFIX],
            SeekDirection::Backward,
            &mut |suffix, _| {
                let mut slice = suffix;
                if let Ok(id) = varint::read_ordered(&mut slice) {
                    next_spend_chain_id = id + 1;
                }
                false
            },
        )?;
        Ok(Self {
            store,
            next_global_index: RwLock::new(HashMap::new()),
            next_spend_chain_id,
        })
    }

    pub(crate) fn read_output(
        &self,
        amount: Amount,
        global_index: u64,
    ) -> Result<Option<OutputRecord>> {
        match self.store.get(&keys::output(amount, global_index))? {
            Some(bytes) => Ok(Some(from_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn write_output(
        &self,
        amount: Amount,
        global_index: u64,
        record: &OutputRecord,
    ) -> Result<()> {
        self.store
            .put(&keys::output(amount, global_index), &to_binary(record))?;
        Ok(())
    }
}

impl ChainState for LedgerState {
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height) -> Result<()> {
        let key = keys::key_image(key_image);
        invariant!(
            !self.store.contains(&key)?,
            "key image {} already in ledger",
            key_image
        );
        self.store.put(&key, &to_binary(&height))?;
        Ok(())
    }

    fn delete_keyimage(&mut self, key_image: &KeyImage) -> Result<()> {
        let key = keys::key_image(key_image);
        invariant!(
            self.store.contains(&key)?,
            "deleting absent key image {}",
            key_image
        );
        self.store.delete(&key)?;
        Ok(())
    }

    fn read_keyimage(&self, key_image: &KeyImage) -> Result<Option<Height>> {
        match self.store.get(&keys::key_image(key_image))? {
            Some(bytes) => Ok(Some(from_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        height: Height,
        public_key: PublicKey,
        is_auditable: bool,
    ) -> Result<u64> {
        let global_index = self.next_global_index_for_amount(amount)?;
        let record = OutputRecord {
            unlock_block_or_timestamp: unlock,
            public_key,
            height,
            is_auditable,
            spent: 0,
            dins: Vec::new(),
        };
        self.write_output(amount, global_index, &record)?;
        self.next_global_index
            .write()
            .expect("lock poisoned")
            .insert(amount, global_index + 1);
        Ok(global_index)
    }

    fn pop_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        public_key: &PublicKey,
        is_auditable: bool,
    ) -> Result<()> {
        let next = self.next_global_index_for_amount(amount)?;
        invariant!(next > 0, "popping output of amount {} with none left", amount);
        let global_index = next - 1;
        let record = self.read_output(amount, global_index)?;
        let record = match record {
            Some(record) => record,
            None => {
                return Err(crate::Error::Invariant(format!(
                    "output {}:{} missing on pop",
                    amount, global_index
                )))
            }
        };
        invariant!(
            record.unlock_block_or_timestamp == unlock
                && record.public_key == *public_key
                && record.is_auditable == is_auditable,
            "output {}:{} does not match the triple it was created with",
            amount,
            global_index
        );
        invariant!(
            record.spent == 0 && record.dins.is_empty(),
            "popping output {}:{} still referenced by spends",
            amount,
            global_index
        );
        self.store.delete(&keys::output(amount, global_index))?;
        self.next_global_index
            .write()
            .expect("lock poisoned")
            .insert(amount, global_index);
        Ok(())
    }

    fn next_global_index_for_amount(&self, amount: Amount) -> Result<u64> {
        if let Some(next) = self
            .next_global_index
            .read()
            .expect("lock poisoned")
            .get(&amount)
        {
            return Ok(*next);
        }
        let mut next = 0;
        self.store.for_each_prefix(
            &keys::output_amount_prefix(amount),
            SeekDirection::Backward,
            &mut |suffix, _| {
                let mut slice = suffix;
                if let Ok(index) = varint::read_ordered(&mut slice) {
                    next = index + 1;
                }
                false
            },
        )?;
        self.next_global_index
            .write()
            .expect("lock poisoned")
            .insert(amount, next);
        Ok(next)
    }

    fn read_amount_output(&self, amount: Amount, global_index: u64) -> Result<Option<OutputRecord>> {
        self.read_output(amount, global_index)
    }
}

/// In-memory overlay over a parent state, scoped to one block height or
/// one pool-speculative application. Applied to the parent on success,
/// dropped otherwise.
pub struct DeltaState<'a> {
    parent: &'a dyn ChainState,
    block_height: Height,
    block_timestamp: Timestamp,
    median_timestamp: Timestamp,
    key_images: HashMap<KeyImage, Height>,
    key_image_order: Vec<KeyImage>,
    outputs: HashMap<Amount, Vec<(BlockOrTimestamp, PublicKey, bool)>>,
    output_order: Vec<Amount>,
}

impl<'a> DeltaState<'a> {
    pub fn new(
        parent: &'a dyn ChainState,
        block_height: Height,
        block_timestamp: Timestamp,
        median_timestamp: Timestamp,
    ) -> Self {
        Self {
            parent,
            block_height,
            block_timestamp,
            median_timestamp,
            key_images: HashMap::new(),
            key_image_order: Vec::new(),
            outputs: HashMap::new(),
            output_order: Vec::new(),
        }
    }

    /// A transaction-scoped overlay on top of this one.
    pub fn child(&self) -> DeltaState<'_> {
        DeltaState::new(
            self,
            self.block_height,
            self.block_timestamp,
            self.median_timestamp,
        )
    }

    pub fn block_height(&self) -> Height {
        self.block_height
    }

    pub fn block_timestamp(&self) -> Timestamp {
        self.block_timestamp
    }

    pub fn median_timestamp(&self) -> Timestamp {
        self.median_timestamp
    }

    /// Resets to an empty overlay at a new scope, reusing allocations when
    /// successive block templates are built.
    pub fn clear(&mut self, block_height: Height, block_timestamp: Timestamp, median_timestamp: Timestamp) {
        self.block_height = block_height;
        self.block_timestamp = block_timestamp;
        self.median_timestamp = median_timestamp;
        self.key_images.clear();
        self.key_image_order.clear();
        self.outputs.clear();
        self.output_order.clear();
    }

    /// Consumes the overlay into an ordered list of mutations, releasing
    /// the parent borrow so the mutations can be applied to it.
    pub fn into_mutations(self) -> DeltaMutations {
        let mut key_images = Vec::with_capacity(self.key_image_order.len());
        for ki in &self.key_image_order {
            key_images.push((*ki, self.key_images[ki]));
        }
        let mut positions: HashMap<Amount, usize> = HashMap::new();
        let mut outputs = Vec::with_capacity(self.output_order.len());
        for amount in &self.output_order {
            let pos = positions.entry(*amount).or_insert(0);
            let (unlock, public_key, is_auditable) = self.outputs[amount][*pos];
            *pos += 1;
            outputs.push((*amount, unlock, public_key, is_auditable));
        }
        DeltaMutations {
            height: self.block_height,
            key_images,
            outputs,
        }
    }
}

impl ChainState for DeltaState<'_> {
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height) -> Result<()> {
        invariant!(
            !self.key_images.contains_key(key_image),
            "key image {} already in delta",
            key_image
        );
        self.key_images.insert(*key_image, height);
        self.key_image_order.push(*key_image);
        Ok(())
    }

    fn delete_keyimage(&mut self, key_image: &KeyImage) -> Result<()> {
        invariant!(
            self.key_images.remove(key_image).is_some(),
            "deleting key image {} absent from delta",
            key_image
        );
        let pos = self
            .key_image_order
            .iter()
            .rposition(|ki| ki == key_image)
            .expect("order list tracks the map");
        self.key_image_order.remove(pos);
        Ok(())
    }

    fn read_keyimage(&self, key_image: &KeyImage) -> Result<Option<Height>> {
        if let Some(height) = self.key_images.get(key_image) {
            return Ok(Some(*height));
        }
        self.parent.read_keyimage(key_image)
    }

    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        _height: Height,
        public_key: PublicKey,
        is_auditable: bool,
    ) -> Result<u64> {
        let base = self.parent.next_global_index_for_amount(amount)?;
        let list = self.outputs.entry(amount).or_default();
        let global_index = base + list.len() as u64;
        list.push((unlock, public_key, is_auditable));
        self.output_order.push(amount);
        Ok(global_index)
    }

    fn pop_amount_output(
        &mut self,
        amount: Amount,
        unlock: BlockOrTimestamp,
        public_key: &PublicKey,
        is_auditable: bool,
    ) -> Result<()> {
        let list = self.outputs.get_mut(&amount);
        let popped = list.and_then(|list| list.pop());
        invariant!(
            popped == Some((unlock, *public_key, is_auditable)),
            "delta pop of amount {} does not match the pushed output",
            amount
        );
        let pos = self
            .output_order
            .iter()
            .rposition(|a| *a == amount)
            .expect("order list tracks the map");
        self.output_order.remove(pos);
        Ok(())
    }

    fn next_global_index_for_amount(&self, amount: Amount) -> Result<u64> {
        let pending = self.outputs.get(&amount).map_or(0, |list| list.len());
        Ok(self.parent.next_global_index_for_amount(amount)? + pending as u64)
    }

    fn read_amount_output(&self, amount: Amount, global_index: u64) -> Result<Option<OutputRecord>> {
        // Outputs created in this scope are deliberately not readable; you
        // cannot spend what this very block or pool application created.
        self.parent.read_amount_output(amount, global_index)
    }
}

/// Ordered mutations extracted from a consumed [`DeltaState`].
pub struct DeltaMutations {
    height: Height,
    key_images: Vec<(KeyImage, Height)>,
    outputs: Vec<(Amount, BlockOrTimestamp, PublicKey, bool)>,
}

impl DeltaMutations {
    /// Replays every key image and output creation onto the target in
    /// insertion order.
    pub fn apply(&self, target: &mut dyn ChainState) -> Result<()> {
        for (key_image, height) in &self.key_images {
            target.store_keyimage(key_image, *height)?;
        }
        for (amount, unlock, public_key, is_auditable) in &self.outputs {
            target.push_amount_output(*amount, *unlock, self.height, *public_key, *is_auditable)?;
        }
        Ok(())
    }

    pub fn key_images(&self) -> &[(KeyImage, Height)] {
        &self.key_images
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_persistence::MemoryStore;

    fn ledger() -> LedgerState {
        LedgerState::new(Arc::new(MemoryStore::new())).unwrap()
    }

    fn ki(byte: u8) -> KeyImage {
        KeyImage([byte; 32])
    }

    fn pk(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    #[test]
    fn test_keyimage_lifecycle() {
        let mut state = ledger();
        state.store_keyimage(&ki(1), 7).unwrap();
        assert_eq!(state.read_keyimage(&ki(1)).unwrap(), Some(7));
        assert!(matches!(
            state.store_keyimage(&ki(1), 8),
            Err(crate::Error::Invariant(_))
        ));
        state.delete_keyimage(&ki(1)).unwrap();
        assert_eq!(state.read_keyimage(&ki(1)).unwrap(), None);
        assert!(matches!(
            state.delete_keyimage(&ki(1)),
            Err(crate::Error::Invariant(_))
        ));
    }

    #[test]
    fn test_global_indices_are_dense_per_amount() {
        let mut state = ledger();
        assert_eq!(state.push_amount_output(100, 0, 1, pk(1), false).unwrap(), 0);
        assert_eq!(state.push_amount_output(100, 0, 1, pk(2), false).unwrap(), 1);
        assert_eq!(state.push_amount_output(200, 0, 1, pk(3), false).unwrap(), 0);
        assert_eq!(state.next_global_index_for_amount(100).unwrap(), 2);
        let record = state.read_amount_output(100, 1).unwrap().unwrap();
        assert_eq!(record.public_key, pk(2));
        assert_eq!(record.spent, 0);
    }

    #[test]
    fn test_next_index_recovered_from_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut state = LedgerState::new(store.clone()).unwrap();
            state.push_amount_output(100, 0, 1, pk(1), false).unwrap();
            state.push_amount_output(100, 0, 1, pk(2), false).unwrap();
        }
        let reopened = LedgerState::new(store).unwrap();
        assert_eq!(reopened.next_global_index_for_amount(100).unwrap(), 2);
        assert_eq!(reopened.next_global_index_for_amount(999).unwrap(), 0);
    }

    #[test]
    fn test_pop_requires_exact_triple() {
        let mut state = ledger();
        state.push_amount_output(100, 5, 1, pk(1), false).unwrap();
        assert!(matches!(
            state.pop_amount_output(100, 5, &pk(2), false),
            Err(crate::Error::Invariant(_))
        ));
    }

    #[test]
    fn test_delta_apply_replays_in_order() {
        let mut state = ledger();
        state.push_amount_output(100, 0, 1, pk(9), false).unwrap();
        let mut delta = DeltaState::new(&state, 2, 1000, 900);
        delta.store_keyimage(&ki(1), 2).unwrap();
        assert_eq!(delta.push_amount_output(100, 0, 2, pk(1), false).unwrap(), 1);
        assert_eq!(delta.push_amount_output(100, 0, 2, pk(2), false).unwrap(), 2);
        assert_eq!(delta.next_global_index_for_amount(100).unwrap(), 3);
        // Spending what the delta created is not possible.
        assert!(delta.read_amount_output(100, 1).unwrap().is_none());
        assert!(delta.read_amount_output(100, 0).unwrap().is_some());

        let mutations = delta.into_mutations();
        let outputs_created = mutations.output_count();
        mutations.apply(&mut state).unwrap();
        assert_eq!(
            state.next_global_index_for_amount(100).unwrap(),
            1 + outputs_created as u64
        );
        assert_eq!(state.read_keyimage(&ki(1)).unwrap(), Some(2));
        assert_eq!(
            state.read_amount_output(100, 2).unwrap().unwrap().public_key,
            pk(2)
        );
    }

    #[test]
    fn test_nested_delta_sees_parent_keyimages() {
        let mut state = ledger();
        state.store_keyimage(&ki(5), 1).unwrap();
        let mut block = DeltaState::new(&state, 2, 0, 0);
        block.store_keyimage(&ki(6), 2).unwrap();
        let child = block.child();
        assert_eq!(child.read_keyimage(&ki(5)).unwrap(), Some(1));
        assert_eq!(child.read_keyimage(&ki(6)).unwrap(), Some(2));
        assert_eq!(child.read_keyimage(&ki(7)).unwrap(), None);
    }
}
