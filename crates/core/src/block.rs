//! Block structures and the prepared (pre-parsed) block wrapper.

use crate::primitives::{Hash, Timestamp};
use crate::transaction::Transaction;
use crate::{binary_size, from_binary, to_binary, Error, Result};
use serde::{Deserialize, Serialize};

/// Header of an auxiliary parent chain carried by merge-mined blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootBlock {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: Timestamp,
    pub previous_block_hash: Hash,
    pub nonce: [u8; 4],
    pub transaction_count: u64,
    /// Merkle branch from the root chain's coinbase to its tx root.
    pub base_transaction_branch: Vec<Hash>,
    pub base_transaction: Transaction,
    /// Merkle branch proving this chain's inclusion under the merge-mining
    /// tag in the root chain's coinbase extra.
    pub blockchain_branch: Vec<Hash>,
}

/// The mined block header together with the coinbase transaction and the
/// hashes of the included transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: Timestamp,
    pub previous_block_hash: Hash,
    pub nonce: Vec<u8>,
    pub root_block: Option<RootBlock>,
    pub base_transaction: Transaction,
    pub transaction_hashes: Vec<Hash>,
}

impl BlockTemplate {
    pub fn is_merge_mined(&self) -> bool {
        self.root_block.is_some()
    }
}

/// A block with its transaction bodies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockTemplate,
    pub transactions: Vec<Transaction>,
}

/// Binary form of a block as relayed between peers: the encoded template
/// plus the encoded transaction bodies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub block: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

/// A structurally parsed block, ready for consensus validation.
///
/// Parsing performs only structural checks; all consensus rules live in the
/// validator. The precomputed sizes and hashes are what the validator and
/// the replay engine need repeatedly.
#[derive(Clone, Debug)]
pub struct PreparedBlock {
    pub block: Block,
    pub raw_block: RawBlock,
    /// Hash of the encoded template, identifies the block.
    pub hash: Hash,
    /// Slow proof-of-work hash, when computed in advance by a worker.
    pub long_hash: Option<Hash>,
    pub coinbase_tx_size: usize,
    pub header_size: usize,
}

impl PreparedBlock {
    /// Parses a raw block and matches its transaction bodies against the
    /// hashes listed in the template.
    pub fn prepare<H>(raw_block: RawBlock, hash_fn: H) -> Result<Self>
    where
        H: Fn(&[u8]) -> Hash,
    {
        let header: BlockTemplate = from_binary(&raw_block.block)?;
        if header.transaction_hashes.len() != raw_block.transactions.len() {
            return Err(Error::BlockStructure(format!(
                "transaction count mismatch: template lists {}, body carries {}",
                header.transaction_hashes.len(),
                raw_block.transactions.len()
            )));
        }
        let mut transactions = Vec::with_capacity(raw_block.transactions.len());
        for (i, binary_tx) in raw_block.transactions.iter().enumerate() {
            if hash_fn(binary_tx) != header.transaction_hashes[i] {
                return Err(Error::BlockStructure(format!(
                    "transaction {} does not match its listed hash",
                    i
                )));
            }
            transactions.push(from_binary::<Transaction>(binary_tx)?);
        }
        let hash = hash_fn(&raw_block.block);
        let coinbase_tx_size = binary_size(&header.base_transaction);
        let header_size = raw_block.block.len() - coinbase_tx_size;
        Ok(Self {
            block: Block {
                header,
                transactions,
            },
            raw_block,
            hash,
            long_hash: None,
            coinbase_tx_size,
            header_size,
        })
    }

    /// Builds a raw block from a full block, then prepares it.
    pub fn from_block<H>(block: Block, hash_fn: H) -> Result<Self>
    where
        H: Fn(&[u8]) -> Hash,
    {
        let raw = RawBlock {
            block: to_binary(&block.header),
            transactions: block.transactions.iter().map(to_binary).collect(),
        };
        Self::prepare(raw, hash_fn)
    }
}
