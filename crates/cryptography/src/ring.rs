//! Key handling, key images and the two ring signature layouts: one
//! signature struct per ring member (legacy) and the batched layout that
//! shares a single opening challenge across all rings of a transaction.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use quartz_core::{EccScalar, Hash, KeyImage, PublicKey, Signature};
use rand::{CryptoRng, RngCore};
use sha3::{Digest, Keccak256};

use crate::{Error, Result};

/// Whether the compressed key decodes to a curve point.
pub fn key_is_valid(key: &PublicKey) -> bool {
    decompress(key.as_bytes()).is_some()
}

/// Whether the key lies in the prime-order subgroup.
pub fn key_in_main_subgroup(key: &PublicKey) -> bool {
    match decompress(key.as_bytes()) {
        Some(point) => point.is_torsion_free(),
        None => false,
    }
}

/// Derives the public key for a secret scalar.
pub fn secret_to_public(secret: &EccScalar) -> Result<PublicKey> {
    let s = scalar(secret).ok_or(Error::InvalidSecretKey)?;
    Ok(PublicKey((&s * ED25519_BASEPOINT_TABLE).compress().0))
}

/// Generates a fresh keypair.
pub fn random_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (PublicKey, EccScalar) {
    let s = Scalar::random(rng);
    let public = PublicKey((&s * ED25519_BASEPOINT_TABLE).compress().0);
    (public, EccScalar(s.to_bytes()))
}

/// Computes the key image binding a keypair: `secret * Hp(public)`.
pub fn generate_key_image(public: &PublicKey, secret: &EccScalar) -> Result<KeyImage> {
    let s = scalar(secret).ok_or(Error::InvalidSecretKey)?;
    let hp = hash_to_point(public);
    Ok(KeyImage((s * hp).compress().0))
}

/// Signs a transaction prefix with a legacy ring signature, hiding the
/// real output among `ring` at position `secret_index`.
pub fn generate_ring_signature<R: RngCore + CryptoRng>(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    secret: &EccScalar,
    secret_index: usize,
    rng: &mut R,
) -> Result<Vec<Signature>> {
    if secret_index >= ring.len() {
        return Err(Error::InvalidSecretKey);
    }
    let x = scalar(secret).ok_or(Error::InvalidSecretKey)?;
    let image = decompress(key_image.as_bytes()).ok_or(Error::InvalidKeyImage)?;

    let mut hasher = Keccak256::new();
    hasher.update(prefix_hash.as_bytes());
    let mut signatures = vec![Signature::default(); ring.len()];
    let mut sum = Scalar::ZERO;
    let mut alpha = Scalar::ZERO;
    for (i, public) in ring.iter().enumerate() {
        let p = decompress(public.as_bytes()).ok_or(Error::InvalidPublicKey)?;
        let hp = hash_to_point(public);
        let (l, r) = if i == secret_index {
            alpha = Scalar::random(rng);
            (&alpha * ED25519_BASEPOINT_TABLE, alpha * hp)
        } else {
            let c = Scalar::random(rng);
            let resp = Scalar::random(rng);
            signatures[i] = Signature {
                c: c.to_bytes(),
                r: resp.to_bytes(),
            };
            sum += c;
            (
                &resp * ED25519_BASEPOINT_TABLE + c * p,
                resp * hp + c * image,
            )
        };
        hasher.update(l.compress().0);
        hasher.update(r.compress().0);
    }
    let challenge = Scalar::from_bytes_mod_order(hasher.finalize().into());
    let c_s = challenge - sum;
    signatures[secret_index] = Signature {
        c: c_s.to_bytes(),
        r: (alpha - c_s * x).to_bytes(),
    };
    Ok(signatures)
}

/// Verifies a legacy ring signature. When `check_key_image_subgroup` is
/// set, key images with a torsion component are rejected.
pub fn check_ring_signature(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    signatures: &[Signature],
    check_key_image_subgroup: bool,
) -> bool {
    if ring.is_empty() || ring.len() != signatures.len() {
        return false;
    }
    let image = match decompress(key_image.as_bytes()) {
        Some(p) => p,
        None => return false,
    };
    if check_key_image_subgroup && !image.is_torsion_free() {
        return false;
    }
    let mut hasher = Keccak256::new();
    hasher.update(prefix_hash.as_bytes());
    let mut sum = Scalar::ZERO;
    for (public, sig) in ring.iter().zip(signatures) {
        let p = match decompress(public.as_bytes()) {
            Some(p) => p,
            None => return false,
        };
        let (c, r) = match (canonical_scalar(&sig.c), canonical_scalar(&sig.r)) {
            (Some(c), Some(r)) => (c, r),
            _ => return false,
        };
        let hp = hash_to_point(public);
        let l = &r * ED25519_BASEPOINT_TABLE + c * p;
        let rr = r * hp + c * image;
        hasher.update(l.compress().0);
        hasher.update(rr.compress().0);
        sum += c;
    }
    Scalar::from_bytes_mod_order(hasher.finalize().into()) == sum
}

/// Signs all rings of a transaction with the batched layout: a shared
/// opening challenge `c0` and one response scalar per ring member.
pub fn generate_ring_signature_batch<R: RngCore + CryptoRng>(
    prefix_hash: &Hash,
    key_images: &[KeyImage],
    rings: &[Vec<PublicKey>],
    secrets: &[EccScalar],
    secret_indexes: &[usize],
    rng: &mut R,
) -> Result<(EccScalar, Vec<Vec<EccScalar>>)> {
    if rings.len() != key_images.len()
        || rings.len() != secrets.len()
        || rings.len() != secret_indexes.len()
    {
        return Err(Error::RingMismatch);
    }
    let mut responses: Vec<Vec<Scalar>> = Vec::with_capacity(rings.len());
    let mut alphas = Vec::with_capacity(rings.len());
    let mut finals = Vec::with_capacity(rings.len());
    // First pass: commit at the secret index of each ring and chain the
    // challenges forward to the end of the ring.
    for (j, ring) in rings.iter().enumerate() {
        let s = secret_indexes[j];
        if s >= ring.len() {
            return Err(Error::InvalidSecretKey);
        }
        let image = decompress(key_images[j].as_bytes()).ok_or(Error::InvalidKeyImage)?;
        let alpha = Scalar::random(rng);
        let hp = hash_to_point(&ring[s]);
        let mut c = step_challenge(
            prefix_hash,
            j,
            s,
            &(&alpha * ED25519_BASEPOINT_TABLE),
            &(alpha * hp),
        );
        let mut ring_responses = vec![Scalar::ZERO; ring.len()];
        for i in s + 1..ring.len() {
            let p = decompress(ring[i].as_bytes()).ok_or(Error::InvalidPublicKey)?;
            let resp = Scalar::random(rng);
            ring_responses[i] = resp;
            let hp = hash_to_point(&ring[i]);
            let l = &resp * ED25519_BASEPOINT_TABLE + c * p;
            let r = resp * hp + c * image;
            c = step_challenge(prefix_hash, j, i, &l, &r);
        }
        responses.push(ring_responses);
        alphas.push(alpha);
        finals.push(c);
    }
    let c0 = close_challenge(prefix_hash, &finals);
    // Second pass: chain from the shared challenge up to the secret index
    // and close each ring there.
    for (j, ring) in rings.iter().enumerate() {
        let s = secret_indexes[j];
        let x = scalar(&secrets[j]).ok_or(Error::InvalidSecretKey)?;
        let image = decompress(key_images[j].as_bytes()).ok_or(Error::InvalidKeyImage)?;
        let mut c = c0;
        for i in 0..s {
            let p = decompress(ring[i].as_bytes()).ok_or(Error::InvalidPublicKey)?;
            let resp = Scalar::random(rng);
            responses[j][i] = resp;
            let hp = hash_to_point(&ring[i]);
            let l = &resp * ED25519_BASEPOINT_TABLE + c * p;
            let r = resp * hp + c * image;
            c = step_challenge(prefix_hash, j, i, &l, &r);
        }
        responses[j][s] = alphas[j] - c * x;
    }
    Ok((
        EccScalar(c0.to_bytes()),
        responses
            .into_iter()
            .map(|ring| ring.into_iter().map(|s| EccScalar(s.to_bytes())).collect())
            .collect(),
    ))
}

/// Verifies a batched ring signature over all rings of a transaction.
pub fn check_ring_signature_batch(
    prefix_hash: &Hash,
    key_images: &[KeyImage],
    rings: &[Vec<PublicKey>],
    c0: &EccScalar,
    responses: &[Vec<EccScalar>],
) -> bool {
    if rings.is_empty() || rings.len() != key_images.len() || rings.len() != responses.len() {
        return false;
    }
    let c0 = match canonical_scalar(&c0.0) {
        Some(c) => c,
        None => return false,
    };
    let mut finals = Vec::with_capacity(rings.len());
    for (j, ring) in rings.iter().enumerate() {
        if ring.is_empty() || ring.len() != responses[j].len() {
            return false;
        }
        let image = match decompress(key_images[j].as_bytes()) {
            Some(p) => p,
            None => return false,
        };
        if !image.is_torsion_free() {
            return false;
        }
        let mut c = c0;
        for (i, public) in ring.iter().enumerate() {
            let p = match decompress(public.as_bytes()) {
                Some(p) => p,
                None => return false,
            };
            let resp = match canonical_scalar(&responses[j][i].0) {
                Some(r) => r,
                None => return false,
            };
            let hp = hash_to_point(public);
            let l = &resp * ED25519_BASEPOINT_TABLE + c * p;
            let r = resp * hp + c * image;
            c = step_challenge(prefix_hash, j, i, &l, &r);
        }
        finals.push(c);
    }
    close_challenge(prefix_hash, &finals) == c0
}

fn decompress(bytes: &[u8; 32]) -> Option<EdwardsPoint> {
    CompressedEdwardsY(*bytes).decompress()
}

fn scalar(value: &EccScalar) -> Option<Scalar> {
    canonical_scalar(&value.0)
}

fn canonical_scalar(bytes: &[u8; 32]) -> Option<Scalar> {
    Scalar::from_canonical_bytes(*bytes).into()
}

fn hash_to_scalar(data: &[u8]) -> Scalar {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Scalar::from_bytes_mod_order(hasher.finalize().into())
}

// Deterministic point derived from a public key, used as the second
// generator in key images.
fn hash_to_point(key: &PublicKey) -> EdwardsPoint {
    &hash_to_scalar(key.as_bytes()) * ED25519_BASEPOINT_TABLE
}

// Challenge after one ring member. The ring and member indexes separate
// the transcripts of different rings sharing a prefix hash.
fn step_challenge(
    prefix_hash: &Hash,
    ring_index: usize,
    member_index: usize,
    l: &EdwardsPoint,
    r: &EdwardsPoint,
) -> Scalar {
    let mut hasher = Keccak256::new();
    hasher.update(prefix_hash.as_bytes());
    hasher.update((ring_index as u64).to_le_bytes());
    hasher.update((member_index as u64).to_le_bytes());
    hasher.update(l.compress().0);
    hasher.update(r.compress().0);
    Scalar::from_bytes_mod_order(hasher.finalize().into())
}

// The shared opening challenge commits to the final challenge of every
// ring.
fn close_challenge(prefix_hash: &Hash, finals: &[Scalar]) -> Scalar {
    let mut hasher = Keccak256::new();
    hasher.update(prefix_hash.as_bytes());
    for c in finals {
        hasher.update(c.to_bytes());
    }
    Scalar::from_bytes_mod_order(hasher.finalize().into())
}
