//! Block and transaction hashing: the fast identity hash, the slow
//! proof-of-work hash, difficulty checks and the transaction merkle tree.

use quartz_core::{Difficulty, Hash};
use sha3::{Digest, Keccak256};

/// Rounds of the iterated permutation used by the proof-of-work hash.
const SLOW_HASH_ROUNDS: usize = 16;

/// Computes the fast hash used for block and transaction identities.
pub fn fast_hash(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Computes the memory-friendly proof-of-work hash.
pub fn slow_hash(data: &[u8]) -> Hash {
    let mut state = fast_hash(data);
    for _ in 0..SLOW_HASH_ROUNDS {
        state = fast_hash(state.as_bytes());
    }
    state
}

/// Checks a proof-of-work hash against a difficulty target.
///
/// The hash is read as a little-endian 256-bit integer; the check passes
/// when `hash * difficulty` does not overflow 256 bits.
pub fn check_hash(hash: &Hash, difficulty: Difficulty) -> bool {
    let mut carry: u128 = 0;
    for chunk in hash.as_bytes().chunks_exact(8) {
        let limb = u64::from_le_bytes(chunk.try_into().unwrap());
        let product = u128::from(limb) * u128::from(difficulty) + carry;
        carry = product >> 64;
    }
    carry == 0
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash(hasher.finalize().into())
}

// Reduces a list of hashes to the merkle root. When `branch` is set, the
// sibling combined with element 0 at each level is recorded, leaf-nearest
// first, so the root can be recomputed from element 0 alone.
fn tree_reduce(hashes: &[Hash], mut branch: Option<&mut Vec<Hash>>) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }
    if hashes.len() == 1 {
        return hashes[0];
    }
    let n = hashes.len();
    let mut pow = 2usize;
    while pow < n {
        pow <<= 1;
    }
    let cnt = pow >> 1;
    // The first 2*cnt - n hashes pass through unchanged; the rest are
    // paired so the level size becomes an exact power of two.
    let copied = 2 * cnt - n;
    let mut level: Vec<Hash> = hashes[..copied].to_vec();
    let mut i = copied;
    while level.len() < cnt {
        level.push(hash_pair(&hashes[i], &hashes[i + 1]));
        i += 2;
    }
    if copied == 0 {
        if let Some(b) = branch.as_deref_mut() {
            b.push(hashes[1]);
        }
    }
    while level.len() > 1 {
        if let Some(b) = branch.as_deref_mut() {
            b.push(level[1]);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        level = next;
    }
    level[0]
}

/// Merkle root of a list of transaction hashes.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    tree_reduce(hashes, None)
}

/// Merkle branch proving inclusion of the first hash (the coinbase).
pub fn coinbase_tree_branch(hashes: &[Hash]) -> Vec<Hash> {
    let mut branch = Vec::new();
    tree_reduce(hashes, Some(&mut branch));
    branch
}

/// Recomputes the merkle root from a leaf and its branch.
pub fn tree_hash_from_branch(branch: &[Hash], leaf: &Hash) -> Hash {
    let mut acc = *leaf;
    for sibling in branch {
        acc = hash_pair(&acc, sibling);
    }
    acc
}
