//! Quartz Core Module
//!
//! Primitive value types (hashes, keys, signatures), the transaction and
//! block structures with their tagged input/output/signature variants, the
//! order-preserving varint used in storage keys, and transaction-extra
//! field parsing.

pub mod block;
pub mod extra;
pub mod primitives;
pub mod transaction;
pub mod varint;

pub use block::{Block, BlockTemplate, PreparedBlock, RawBlock, RootBlock};
pub use extra::MergeMiningTag;
pub use primitives::{
    Amount, BlockOrTimestamp, CumulativeDifficulty, Difficulty, EccScalar, Hash, Height, KeyImage,
    PublicKey, Signature, Timestamp,
};
pub use transaction::{
    relative_offsets_to_absolute, Transaction, TransactionInput, TransactionOutput,
    TransactionPrefix, TransactionSignatures,
};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core-level error types
#[derive(Debug, Error)]
pub enum Error {
    /// Binary decoding failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Binary encoding failed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Varint is malformed or does not fit the target type
    #[error("Varint error: {0}")]
    Varint(String),

    /// Transaction-extra field is malformed
    #[error("Extra field error: {0}")]
    Extra(String),

    /// Block structure is inconsistent with its binary representation
    #[error("Block structure error: {0}")]
    BlockStructure(String),
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Decode(err.to_string())
    }
}

/// Serializes a value with the canonical binary encoding.
pub fn to_binary<T: serde::Serialize>(value: &T) -> Vec<u8> {
    // bincode with fixed-int encoding cannot fail on our plain-data structs
    bincode::serialize(value).expect("canonical encoding failed")
}

/// Deserializes a value from the canonical binary encoding.
pub fn from_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Serialized size of a value under the canonical binary encoding.
pub fn binary_size<T: serde::Serialize>(value: &T) -> usize {
    bincode::serialized_size(value).expect("canonical encoding failed") as usize
}
