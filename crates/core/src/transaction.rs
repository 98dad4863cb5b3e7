//! Transaction structures.
//!
//! Inputs, outputs and signature bundles are closed sets of protocol
//! variants, modeled as enums and dispatched by explicit `match`. The set
//! is fixed by protocol version and is never extended dynamically.

use crate::primitives::{Amount, BlockOrTimestamp, EccScalar, Height, KeyImage, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// A single transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionInput {
    /// Reward-granting input of the coinbase transaction. Carries the block
    /// height it was created at.
    Coinbase { height: Height },
    /// Spend of one output among a ring of candidates.
    Key {
        amount: Amount,
        /// Relative offsets into the per-amount global output index.
        output_offsets: Vec<u64>,
        key_image: KeyImage,
    },
}

/// A single transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutput {
    Key {
        amount: Amount,
        public_key: PublicKey,
        /// Auditable outputs cannot be referenced as ring decoys.
        is_auditable: bool,
    },
}

impl TransactionOutput {
    pub fn amount(&self) -> Amount {
        match self {
            TransactionOutput::Key { amount, .. } => *amount,
        }
    }
}

/// Signature bundle of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSignatures {
    /// Coinbase transactions carry no signatures.
    None,
    /// Legacy scheme: one independent ring signature per input.
    Ring(Vec<Vec<Signature>>),
    /// Compact scheme: a single shared challenge with per-input response
    /// vectors, verified in one batch across all inputs.
    Compact { c0: EccScalar, r: Vec<Vec<EccScalar>> },
}

/// Prefix of a transaction: everything that is signed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_block_or_timestamp: BlockOrTimestamp,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

/// A full transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    pub signatures: TransactionSignatures,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            prefix: TransactionPrefix::default(),
            signatures: TransactionSignatures::None,
        }
    }
}

impl Transaction {
    /// True when the transaction has the single-coinbase-input shape.
    pub fn is_coinbase(&self) -> bool {
        self.prefix.inputs.len() == 1
            && matches!(self.prefix.inputs[0], TransactionInput::Coinbase { .. })
    }

    /// Sum of all output amounts. Saturates rather than wraps; overflow is
    /// rejected separately during semantic validation.
    pub fn sum_outputs(&self) -> Amount {
        self.prefix
            .outputs
            .iter()
            .fold(0u64, |acc, o| acc.saturating_add(o.amount()))
    }
}

/// Converts relative ring-member offsets to absolute per-amount global
/// indices. Returns `None` when the list is empty, contains a repeated
/// member (zero offset after the first), or overflows.
pub fn relative_offsets_to_absolute(offsets: &[u64]) -> Option<Vec<u64>> {
    let (&first, rest) = offsets.split_first()?;
    let mut result = Vec::with_capacity(offsets.len());
    result.push(first);
    let mut acc = first;
    for &off in rest {
        if off == 0 {
            return None;
        }
        acc = acc.checked_add(off)?;
        result.push(acc);
    }
    Some(result)
}
