//! Fixed-size value types shared across the node.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Atomic currency units.
pub type Amount = u64;
/// Block height.
pub type Height = u32;
/// Unix timestamp in seconds.
pub type Timestamp = u64;
/// A block height or a unix timestamp, disambiguated by a protocol threshold.
pub type BlockOrTimestamp = u64;
/// Proof-of-work difficulty.
pub type Difficulty = u64;
/// Sum of difficulties from genesis to a block.
pub type CumulativeDifficulty = u64;

macro_rules! define_hash32 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// All-zero value, used as a sentinel.
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                let arr: [u8; 32] = slice.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

define_hash32!(
    /// 32-byte hash digest.
    Hash
);
define_hash32!(
    /// One-time spend tag of an output, detects double-spends.
    KeyImage
);
define_hash32!(
    /// Compressed curve point.
    PublicKey
);
define_hash32!(
    /// Curve scalar, used inside compact ring signatures.
    EccScalar
);

/// Two-scalar ring signature element (challenge and response).
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub c: [u8; 32],
    pub r: [u8; 32],
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}{})", hex::encode(self.c), hex::encode(self.r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_display_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = Hash(bytes);
        let s = hash.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab"));
        assert!(s.ends_with("01"));
        assert_eq!(Hash::from_slice(&hex::decode(&s).unwrap()), Some(hash));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_none());
        assert!(Hash::from_slice(&[0u8; 33]).is_none());
    }

    #[test]
    fn test_zero_sentinel() {
        assert_eq!(Hash::ZERO, Hash::default());
        assert_ne!(Hash::ZERO, Hash([1u8; 32]));
    }
}
