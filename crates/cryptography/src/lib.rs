//! Quartz Cryptography Module
//!
//! Hash functions (identity, proof-of-work and merkle), difficulty checks,
//! ed25519 key validation, key images and ring signatures.

pub mod hash;
pub mod ring;

pub use hash::{
    check_hash, coinbase_tree_branch, fast_hash, slow_hash, tree_hash, tree_hash_from_branch,
};
pub use ring::{
    check_ring_signature, check_ring_signature_batch, generate_key_image, generate_ring_signature,
    generate_ring_signature_batch, key_in_main_subgroup, key_is_valid, random_keypair,
    secret_to_public,
};

use thiserror::Error;

/// Result type for cryptography operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cryptography-level error types
#[derive(Debug, Error)]
pub enum Error {
    /// Public key does not decode to a curve point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Secret scalar is out of range
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Key image does not decode to a curve point
    #[error("Invalid key image")]
    InvalidKeyImage,

    /// Ring, key image and response lists disagree in length
    #[error("Mismatched ring signature inputs")]
    RingMismatch,
}
