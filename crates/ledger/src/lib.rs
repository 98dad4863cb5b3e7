//! Quartz Ledger Module
//!
//! The consensus-enforcing state engine: block and transaction validation,
//! the layered delta state over the persistent output/key-image ledger,
//! spend-chain bookkeeping for multi-candidate ring inputs, the fee-ordered
//! transaction pool and the mining block template builder.

pub mod chain;
pub mod currency;
pub mod pool;
pub mod replay;
pub mod spend_chain;
pub mod state;
pub mod template;
pub mod validate;

pub use chain::{BlockChainState, BlockChainStatistics, BlockHeaderInfo, Config};
pub use currency::Currency;
pub use pool::{PoolStatistics, PoolTransaction, TransactionDesc};
pub use replay::RingChecker;
pub use state::{ChainState, DeltaState, LedgerState, OutputRecord};
pub use template::MiningTemplate;
pub use validate::validate_semantic;

use quartz_core::{Height, KeyImage};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger-level error types
#[derive(Debug, Error)]
pub enum Error {
    /// Consensus rule violation; the block or transaction is rejected
    #[error("Consensus violation: {0}")]
    Consensus(String),

    /// A referenced output's key image is already spent
    #[error("Output spent: key image {key_image}, conflict at height {conflict_height}")]
    OutputSpent {
        key_image: KeyImage,
        conflict_height: Height,
    },

    /// A referenced output does not exist in the visible state
    #[error("Output does not exist: input {input_index}, global index {global_index}")]
    OutputDoesNotExist {
        input_index: usize,
        global_index: u64,
    },

    /// Ring signature failed or a referenced output changed under a reorg
    #[error("Bad output or signature: {reason} (newest referenced height {newest_referenced_height})")]
    BadOutputOrSignature {
        reason: String,
        newest_referenced_height: Height,
    },

    /// Persistent state is inconsistent; fatal, consensus data may be corrupt
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Underlying store failure
    #[error(transparent)]
    Storage(#[from] quartz_persistence::Error),

    /// Persisted record failed to decode
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<quartz_core::Error> for Error {
    fn from(err: quartz_core::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Fails with [`Error::Invariant`] when the condition does not hold.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::Error::Invariant(format!($($arg)*)));
        }
    };
}
pub(crate) use invariant;
