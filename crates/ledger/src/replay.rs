//! Transaction replay: applying a transaction's effects onto a delta
//! state (redo) and reversing them on the persistent ledger (undo), with
//! ring signatures dispatched to a parallel checker.

use crate::chain::BlockHeaderInfo;
use crate::currency::Currency;
use crate::state::{ChainState, DeltaState, LedgerState};
use crate::{Error, Result};
use quartz_core::{
    relative_offsets_to_absolute, to_binary, Amount, EccScalar, Hash, Height, KeyImage,
    PreparedBlock, PublicKey, Signature, Transaction, TransactionInput, TransactionOutput,
    TransactionSignatures,
};
use quartz_cryptography::{check_ring_signature, check_ring_signature_batch, fast_hash};
use std::num::NonZeroUsize;

/// Outcome of a successful transaction redo.
#[derive(Debug)]
pub(crate) struct RedoResult {
    /// Global index assigned to each key-type output, in output order.
    pub global_indices: Vec<u64>,
    /// Greatest creation height among all referenced outputs.
    pub newest_referenced_height: Height,
}

enum SigJob {
    Legacy {
        prefix_hash: Hash,
        key_image: KeyImage,
        ring: Vec<PublicKey>,
        signatures: Vec<Signature>,
        check_subgroup: bool,
        newest_referenced_height: Height,
    },
    Batch {
        prefix_hash: Hash,
        key_images: Vec<KeyImage>,
        rings: Vec<Vec<PublicKey>>,
        c0: EccScalar,
        responses: Vec<Vec<EccScalar>>,
        newest_referenced_height: Height,
    },
}

impl SigJob {
    fn verify(&self) -> Result<()> {
        let (ok, newest) = match self {
            SigJob::Legacy {
                prefix_hash,
                key_image,
                ring,
                signatures,
                check_subgroup,
                newest_referenced_height,
            } => (
                check_ring_signature(prefix_hash, key_image, ring, signatures, *check_subgroup),
                *newest_referenced_height,
            ),
            SigJob::Batch {
                prefix_hash,
                key_images,
                rings,
                c0,
                responses,
                newest_referenced_height,
            } => (
                check_ring_signature_batch(prefix_hash, key_images, rings, c0, responses),
                *newest_referenced_height,
            ),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::BadOutputOrSignature {
                reason: "ring signature check failed".into(),
                newest_referenced_height: newest,
            })
        }
    }
}

/// Collects every ring-signature job of a block and verifies them on a
/// worker pool after replay, before the block's effects are committed.
#[derive(Default)]
pub struct RingChecker {
    jobs: Vec<SigJob>,
}

impl RingChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies all collected jobs in parallel, surfacing the error of the
    /// earliest failing job.
    pub fn verify_all(self) -> Result<()> {
        if self.jobs.is_empty() {
            return Ok(());
        }
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .min(self.jobs.len());
        let chunk_size = self.jobs.len().div_ceil(workers);
        let jobs = &self.jobs;
        let mut first_failure: Option<(usize, Error)> = None;
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for (chunk_index, chunk) in jobs.chunks(chunk_size).enumerate() {
                handles.push(scope.spawn(move || {
                    for (offset, job) in chunk.iter().enumerate() {
                        if let Err(err) = job.verify() {
                            return Some((chunk_index * chunk_size + offset, err));
                        }
                    }
                    None
                }));
            }
            for handle in handles {
                if let Some((index, err)) = handle.join().expect("signature worker panicked") {
                    if first_failure.as_ref().map_or(true, |(first, _)| index < *first) {
                        first_failure = Some((index, err));
                    }
                }
            }
        });
        match first_failure {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

fn transaction_prefix_hash(tx: &Transaction) -> Hash {
    fast_hash(&to_binary(&tx.prefix))
}

pub(crate) fn absolute_offsets(
    amount: Amount,
    output_offsets: &[u64],
) -> Result<Vec<u64>> {
    relative_offsets_to_absolute(output_offsets).ok_or_else(|| {
        Error::Consensus(format!(
            "input over amount {} has malformed output offsets",
            amount
        ))
    })
}

/// Applies a transaction onto a transaction-scoped child of `delta`; the
/// child is merged into `delta` only after every input passes, so partial
/// application is never visible.
///
/// When `ring_checker` is given, legacy signatures are queued per input
/// and compact signatures as one batched job per transaction; `None`
/// skips signature checking (coinbase, trusted replay).
pub(crate) fn redo_transaction(
    currency: &Currency,
    block_major_version: u8,
    tx: &Transaction,
    delta: &mut DeltaState<'_>,
    mut ring_checker: Option<&mut RingChecker>,
) -> Result<RedoResult> {
    let mut child = delta.child();
    let mut newest_referenced_height: Height = 0;
    let mut batch_key_images = Vec::new();
    let mut batch_rings = Vec::new();
    let prefix_hash = if ring_checker.is_some() {
        transaction_prefix_hash(tx)
    } else {
        Hash::ZERO
    };
    let check_subgroup = child.block_height() >= currency.key_image_subgroup_checking_height;

    for (input_index, input) in tx.prefix.inputs.iter().enumerate() {
        let TransactionInput::Key {
            amount,
            output_offsets,
            key_image,
        } = input
        else {
            continue;
        };
        if let Some(conflict_height) = child.read_keyimage(key_image)? {
            return Err(Error::OutputSpent {
                key_image: *key_image,
                conflict_height,
            });
        }
        let absolute = absolute_offsets(*amount, output_offsets)?;
        let mut ring = Vec::with_capacity(absolute.len());
        for &global_index in &absolute {
            let record = child.read_amount_output(*amount, global_index)?.ok_or(
                Error::OutputDoesNotExist {
                    input_index,
                    global_index,
                },
            )?;
            if record.is_auditable && absolute.len() > 1 {
                return Err(Error::Consensus(format!(
                    "auditable output {}:{} referenced with ring size {}",
                    amount,
                    global_index,
                    absolute.len()
                )));
            }
            if !currency.is_transaction_unlocked(
                block_major_version,
                record.unlock_block_or_timestamp,
                child.block_height(),
                child.block_timestamp(),
                child.median_timestamp(),
            ) {
                return Err(Error::Consensus(format!(
                    "referenced output {}:{} is still locked",
                    amount, global_index
                )));
            }
            newest_referenced_height = newest_referenced_height.max(record.height);
            ring.push(record.public_key);
        }
        if ring_checker.is_some() {
            match &tx.signatures {
                TransactionSignatures::Ring(all_signatures) => {
                    let signatures = all_signatures.get(input_index).ok_or_else(|| {
                        Error::Consensus("ring signature count does not match inputs".into())
                    })?;
                    if let Some(checker) = ring_checker.as_deref_mut() {
                        checker.jobs.push(SigJob::Legacy {
                            prefix_hash,
                            key_image: *key_image,
                            ring,
                            signatures: signatures.clone(),
                            check_subgroup,
                            newest_referenced_height,
                        });
                    }
                }
                TransactionSignatures::Compact { .. } => {
                    batch_key_images.push(*key_image);
                    batch_rings.push(ring);
                }
                TransactionSignatures::None => {
                    return Err(Error::Consensus("transaction carries no signatures".into()))
                }
            }
        }
    }
    if !batch_key_images.is_empty() {
        if let (Some(checker), TransactionSignatures::Compact { c0, r }) =
            (ring_checker.as_deref_mut(), &tx.signatures)
        {
            checker.jobs.push(SigJob::Batch {
                prefix_hash,
                key_images: batch_key_images,
                rings: batch_rings,
                c0: *c0,
                responses: r.clone(),
                newest_referenced_height,
            });
        }
    }

    // Key images land in the child only now, after all input checks, so a
    // half-validated transaction leaves no trace.
    let height = child.block_height();
    for input in &tx.prefix.inputs {
        if let TransactionInput::Key { key_image, .. } = input {
            child.store_keyimage(key_image, height)?;
        }
    }
    let mut global_indices = Vec::with_capacity(tx.prefix.outputs.len());
    for output in &tx.prefix.outputs {
        let TransactionOutput::Key {
            amount,
            public_key,
            is_auditable,
        } = output;
        let global_index = child.push_amount_output(
            *amount,
            tx.prefix.unlock_block_or_timestamp,
            height,
            *public_key,
            *is_auditable,
        )?;
        global_indices.push(global_index);
    }
    let mutations = child.into_mutations();
    mutations.apply(delta)?;
    Ok(RedoResult {
        global_indices,
        newest_referenced_height,
    })
}

/// Reverses a transaction on the persistent ledger: pops outputs in
/// reverse creation order, then unprocesses and deletes each key input.
pub(crate) fn undo_transaction(ledger: &mut LedgerState, tx: &Transaction) -> Result<()> {
    for output in tx.prefix.outputs.iter().rev() {
        let TransactionOutput::Key {
            amount,
            public_key,
            is_auditable,
        } = output;
        ledger.pop_amount_output(
            *amount,
            tx.prefix.unlock_block_or_timestamp,
            public_key,
            *is_auditable,
        )?;
    }
    for input in tx.prefix.inputs.iter().rev() {
        if let TransactionInput::Key {
            amount,
            output_offsets,
            key_image,
        } = input
        {
            let absolute = absolute_offsets(*amount, output_offsets)?;
            ledger.unprocess_input(*amount, &absolute)?;
            ledger.delete_keyimage(key_image)?;
        }
    }
    Ok(())
}

/// Replays a whole block onto a block-scoped delta, verifies the collected
/// signatures, then applies the delta to the ledger and records the
/// confirmed spends. Returns the per-transaction output global indices,
/// coinbase first.
pub(crate) fn redo_block(
    ledger: &mut LedgerState,
    currency: &Currency,
    block: &PreparedBlock,
    info: &BlockHeaderInfo,
    check_sigs: bool,
) -> Result<Vec<Vec<u64>>> {
    let mut delta = DeltaState::new(ledger, info.height, info.timestamp, info.timestamp_median);
    let mut checker = RingChecker::new();
    let mut all_indices = Vec::with_capacity(1 + block.block.transactions.len());
    let coinbase = redo_transaction(
        currency,
        info.major_version,
        &block.block.header.base_transaction,
        &mut delta,
        None,
    )?;
    all_indices.push(coinbase.global_indices);
    for tx in &block.block.transactions {
        let result = redo_transaction(
            currency,
            info.major_version,
            tx,
            &mut delta,
            if check_sigs { Some(&mut checker) } else { None },
        )?;
        all_indices.push(result.global_indices);
    }
    checker.verify_all()?;
    let mutations = delta.into_mutations();
    mutations.apply(ledger)?;
    for tx in &block.block.transactions {
        for input in &tx.prefix.inputs {
            if let TransactionInput::Key {
                amount,
                output_offsets,
                ..
            } = input
            {
                let absolute = absolute_offsets(*amount, output_offsets)?;
                ledger.process_input(*amount, &absolute)?;
            }
        }
    }
    Ok(all_indices)
}

/// Reverses a block on the persistent ledger, transactions in reverse
/// order, coinbase last.
pub(crate) fn undo_block(ledger: &mut LedgerState, block: &PreparedBlock) -> Result<()> {
    for tx in block.block.transactions.iter().rev() {
        undo_transaction(ledger, tx)?;
    }
    undo_transaction(ledger, &block.block.header.base_transaction)?;
    Ok(())
}
