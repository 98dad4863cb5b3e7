//! Spend-chain ("DIN") bookkeeping for multi-candidate ring inputs.
//!
//! A record is created per ring input referencing more than one candidate
//! output. Marking an output spent removes it as a live candidate from
//! every other record listing it; a record collapsing to a single live
//! candidate spends that candidate recursively. Undo mirrors everything in
//! strict reverse order.

use crate::state::{keys, LedgerState, OutputRecord};
use crate::{invariant, Error, Result};
use quartz_core::{from_binary, to_binary, Amount};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// 0 disables tracking, 1 tracks only single-candidate inputs, 2 tracks
/// full chains.
pub(crate) const CHAIN_REACTION_LEVEL: u8 = 2;

/// Outputs grandfathered at spend count 2: double-spent historically
/// through the since-patched subgroup-check bug.
pub(crate) const LEGACY_DOUBLE_SPEND_EXCEPTIONS: [(Amount, u64); 2] =
    [(6_299_999_999_000_000, 0), (18_899_999_999_000_000, 0)];

fn is_legacy_double_spend(amount: Amount, global_index: u64) -> bool {
    LEGACY_DOUBLE_SPEND_EXCEPTIONS.contains(&(amount, global_index))
}

/// Persisted per multi-candidate ring input. `unspent` is kept sorted for
/// binary-search removal; `spent_stack` is the undo stack of candidates
/// removed after creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SpendChainRecord {
    pub amount: Amount,
    pub unspent: Vec<u64>,
    pub spent_stack: Vec<u64>,
}

impl LedgerState {
    pub(crate) fn read_spend_chain(&self, record_id: u64) -> Result<SpendChainRecord> {
        match self.store.get(&keys::spend_chain(record_id))? {
            Some(bytes) => Ok(from_binary(&bytes)?),
            None => Err(Error::Invariant(format!(
                "spend-chain record {} missing",
                record_id
            ))),
        }
    }

    fn write_spend_chain(&self, record_id: u64, record: &SpendChainRecord) -> Result<()> {
        self.store
            .put(&keys::spend_chain(record_id), &to_binary(record))?;
        Ok(())
    }

    fn required_output(&self, amount: Amount, global_index: u64) -> Result<OutputRecord> {
        self.read_output(amount, global_index)?.ok_or_else(|| {
            Error::Invariant(format!(
                "output {}:{} missing during spend tracking",
                amount, global_index
            ))
        })
    }

    /// Records a confirmed ring input's candidates. Ring size one spends
    /// the output directly; larger rings allocate a spend-chain record.
    pub(crate) fn process_input(&mut self, amount: Amount, global_indices: &[u64]) -> Result<()> {
        if CHAIN_REACTION_LEVEL == 0 {
            return Ok(());
        }
        if global_indices.len() == 1 {
            return self.spend_output(amount, global_indices[0], None);
        }
        if CHAIN_REACTION_LEVEL < 2 {
            return Ok(());
        }
        let record_id = self.next_spend_chain_id;
        self.next_spend_chain_id += 1;
        let mut record = SpendChainRecord {
            amount,
            unspent: Vec::new(),
            spent_stack: Vec::new(),
        };
        for &global_index in global_indices {
            let mut output = self.required_output(amount, global_index)?;
            if output.spent == 0 {
                // Ids increase monotonically, so appending keeps dins sorted.
                output.dins.push(record_id);
                self.write_output(amount, global_index, &output)?;
                record.unspent.push(global_index);
            }
        }
        invariant!(
            !record.unspent.is_empty(),
            "ring input over amount {} has no unspent candidates",
            amount
        );
        self.write_spend_chain(record_id, &record)?;
        trace!(record_id, amount, candidates = record.unspent.len(), "spend-chain record created");
        if record.unspent.len() == 1 {
            self.spend_output(amount, record.unspent[0], Some(record_id))?;
        }
        Ok(())
    }

    /// Exact inverse of [`process_input`], relying on strict reverse-order
    /// undo: the record being unprocessed is always the newest one.
    pub(crate) fn unprocess_input(&mut self, amount: Amount, global_indices: &[u64]) -> Result<()> {
        if CHAIN_REACTION_LEVEL == 0 {
            return Ok(());
        }
        if global_indices.len() == 1 {
            return self.unspend_output(amount, global_indices[0], None);
        }
        if CHAIN_REACTION_LEVEL < 2 {
            return Ok(());
        }
        invariant!(self.next_spend_chain_id > 0, "no spend-chain records to unprocess");
        let record_id = self.next_spend_chain_id - 1;
        let record = self.read_spend_chain(record_id)?;
        invariant!(
            record.amount == amount && record.spent_stack.is_empty(),
            "spend-chain record {} not in creation state on undo",
            record_id
        );
        if record.unspent.len() == 1 {
            self.unspend_output(amount, record.unspent[0], Some(record_id))?;
        }
        for &global_index in record.unspent.iter().rev() {
            let mut output = self.required_output(amount, global_index)?;
            invariant!(
                output.dins.last() == Some(&record_id),
                "output {}:{} dins out of order on undo",
                amount,
                global_index
            );
            output.dins.pop();
            self.write_output(amount, global_index, &output)?;
        }
        self.store.delete(&keys::spend_chain(record_id))?;
        self.next_spend_chain_id = record_id;
        Ok(())
    }

    /// Marks an output spent and propagates the chain reaction through
    /// every other record listing it as a live candidate.
    ///
    /// The explicit action stack reproduces depth-first order: a collapsed
    /// record's last candidate is fully spent before the next record of
    /// the current output is touched. Undo relies on this exact order.
    pub(crate) fn spend_output(
        &mut self,
        amount: Amount,
        global_index: u64,
        trigger_record: Option<u64>,
    ) -> Result<()> {
        enum Action {
            Spend { global_index: u64, trigger: Option<u64> },
            Remove { din: u64, global_index: u64 },
        }
        let mut work = vec![Action::Spend {
            global_index,
            trigger: trigger_record,
        }];
        while let Some(action) = work.pop() {
            match action {
                Action::Spend {
                    global_index,
                    trigger,
                } => {
                    let mut output = self.required_output(amount, global_index)?;
                    output.spent += 1;
                    let allowed = if is_legacy_double_spend(amount, global_index) {
                        2
                    } else {
                        1
                    };
                    invariant!(
                        output.spent <= allowed,
                        "output {}:{} spent {} times",
                        amount,
                        global_index,
                        output.spent
                    );
                    self.write_output(amount, global_index, &output)?;
                    if output.spent != 1 {
                        continue;
                    }
                    // Reversed push so removals pop in din order.
                    for &din in output.dins.iter().rev() {
                        if Some(din) == trigger {
                            continue;
                        }
                        work.push(Action::Remove { din, global_index });
                    }
                }
                Action::Remove { din, global_index } => {
                    let mut record = self.read_spend_chain(din)?;
                    let pos = match record.unspent.binary_search(&global_index) {
                        Ok(pos) => pos,
                        Err(_) => {
                            return Err(Error::Invariant(format!(
                                "record {} does not list candidate {}",
                                din, global_index
                            )))
                        }
                    };
                    record.unspent.remove(pos);
                    record.spent_stack.push(global_index);
                    let survivor = record.unspent.first().copied();
                    let collapsed = record.unspent.len() == 1;
                    self.write_spend_chain(din, &record)?;
                    if collapsed {
                        trace!(record = din, "spend-chain record collapsed, spending last candidate");
                        work.push(Action::Spend {
                            global_index: survivor.expect("collapsed record has one candidate"),
                            trigger: Some(din),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Mirror of [`spend_output`]: per record in reverse din order, first
    /// undoes the collapse-triggered spend, then restores the removed
    /// candidate.
    pub(crate) fn unspend_output(
        &mut self,
        amount: Amount,
        global_index: u64,
        trigger_record: Option<u64>,
    ) -> Result<()> {
        enum Action {
            Unspend { global_index: u64, trigger: Option<u64> },
            UndoDin { din: u64, global_index: u64 },
            Restore { din: u64, global_index: u64 },
        }
        let mut work = vec![Action::Unspend {
            global_index,
            trigger: trigger_record,
        }];
        while let Some(action) = work.pop() {
            match action {
                Action::Unspend {
                    global_index,
                    trigger,
                } => {
                    let mut output = self.required_output(amount, global_index)?;
                    invariant!(
                        output.spent > 0,
                        "unspending output {}:{} that is not spent",
                        amount,
                        global_index
                    );
                    output.spent -= 1;
                    self.write_output(amount, global_index, &output)?;
                    if output.spent != 0 {
                        continue;
                    }
                    // Forward push so pops run in reverse din order.
                    for &din in &output.dins {
                        if Some(din) == trigger {
                            continue;
                        }
                        work.push(Action::UndoDin { din, global_index });
                    }
                }
                Action::UndoDin { din, global_index } => {
                    // Evaluated on pop, once every later removal from this
                    // record has already been undone: if our removal left
                    // the record collapsed, undo the triggered spend
                    // before restoring the candidate.
                    let record = self.read_spend_chain(din)?;
                    work.push(Action::Restore { din, global_index });
                    if record.unspent.len() == 1
                        && record.spent_stack.last() == Some(&global_index)
                    {
                        work.push(Action::Unspend {
                            global_index: record.unspent[0],
                            trigger: Some(din),
                        });
                    }
                }
                Action::Restore { din, global_index } => {
                    let mut record = self.read_spend_chain(din)?;
                    invariant!(
                        record.spent_stack.last() == Some(&global_index),
                        "record {} undo stack out of order for candidate {}",
                        din,
                        global_index
                    );
                    record.spent_stack.pop();
                    let pos = record
                        .unspent
                        .binary_search(&global_index)
                        .expect_err("candidate cannot be both spent and live");
                    record.unspent.insert(pos, global_index);
                    self.write_spend_chain(din, &record)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChainState;
    use quartz_core::PublicKey;
    use quartz_persistence::MemoryStore;
    use std::sync::Arc;

    fn ledger_with_outputs(amount: Amount, count: u64) -> LedgerState {
        let mut state = LedgerState::new(Arc::new(MemoryStore::new())).unwrap();
        for i in 0..count {
            state
                .push_amount_output(amount, 0, 1, PublicKey([i as u8; 32]), false)
                .unwrap();
        }
        state
    }

    fn spent(state: &LedgerState, amount: Amount, gi: u64) -> u8 {
        state.read_output(amount, gi).unwrap().unwrap().spent
    }

    #[test]
    fn test_single_candidate_spends_directly() {
        let mut state = ledger_with_outputs(100, 1);
        state.process_input(100, &[0]).unwrap();
        assert_eq!(spent(&state, 100, 0), 1);
        assert!(matches!(
            state.process_input(100, &[0]),
            Err(Error::Invariant(_))
        ));
        state.unprocess_input(100, &[0]).unwrap();
        assert_eq!(spent(&state, 100, 0), 0);
    }

    #[test]
    fn test_multi_candidate_creates_record_without_spending() {
        let mut state = ledger_with_outputs(100, 3);
        state.process_input(100, &[0, 1, 2]).unwrap();
        for gi in 0..3 {
            let out = state.read_output(100, gi).unwrap().unwrap();
            assert_eq!(out.spent, 0);
            assert_eq!(out.dins, vec![0]);
        }
        let record = state.read_spend_chain(0).unwrap();
        assert_eq!(record.unspent, vec![0, 1, 2]);
        assert!(record.spent_stack.is_empty());
    }

    #[test]
    fn test_chain_reaction_propagates_through_records() {
        let mut state = ledger_with_outputs(100, 3);
        // Record 0 watches {0,1,2}, record 1 watches {0,1}.
        state.process_input(100, &[0, 1, 2]).unwrap();
        state.process_input(100, &[0, 1]).unwrap();
        // Direct spend of 0 collapses record 1 to {1}, spending 1, which
        // collapses record 0 to {2}, spending 2.
        state.process_input(100, &[0]).unwrap();
        assert_eq!(spent(&state, 100, 0), 1);
        assert_eq!(spent(&state, 100, 1), 1);
        assert_eq!(spent(&state, 100, 2), 1);

        // Full undo in reverse order restores the initial records exactly.
        state.unprocess_input(100, &[0]).unwrap();
        assert_eq!(spent(&state, 100, 0), 0);
        assert_eq!(spent(&state, 100, 1), 0);
        assert_eq!(spent(&state, 100, 2), 0);
        assert_eq!(state.read_spend_chain(1).unwrap().unspent, vec![0, 1]);
        state.unprocess_input(100, &[0, 1]).unwrap();
        state.unprocess_input(100, &[0, 1, 2]).unwrap();
        for gi in 0..3 {
            let out = state.read_output(100, gi).unwrap().unwrap();
            assert_eq!(out.spent, 0);
            assert!(out.dins.is_empty());
        }
        assert_eq!(state.next_spend_chain_id, 0);
    }

    #[test]
    fn test_record_collapsing_to_one_spends_exactly_once() {
        let mut state = ledger_with_outputs(200, 2);
        state.process_input(200, &[0, 1]).unwrap();
        state.process_input(200, &[0]).unwrap();
        // Record 0 collapsed to {1}; 1 was spent recursively.
        assert_eq!(spent(&state, 200, 1), 1);
        let record = state.read_spend_chain(0).unwrap();
        assert_eq!(record.unspent, vec![1]);
        assert_eq!(record.spent_stack, vec![0]);
    }

    #[test]
    fn test_creation_with_single_live_candidate_spends_it() {
        let mut state = ledger_with_outputs(300, 2);
        state.process_input(300, &[0]).unwrap();
        // Candidate 0 is already spent, so the new record starts at {1}.
        state.process_input(300, &[0, 1]).unwrap();
        assert_eq!(spent(&state, 300, 1), 1);
        state.unprocess_input(300, &[0, 1]).unwrap();
        assert_eq!(spent(&state, 300, 1), 0);
        let out = state.read_output(300, 1).unwrap().unwrap();
        assert!(out.dins.is_empty());
    }

    #[test]
    fn test_legacy_exception_allows_double_spend() {
        let (amount, gi) = LEGACY_DOUBLE_SPEND_EXCEPTIONS[0];
        let mut state = ledger_with_outputs(amount, 1);
        state.process_input(amount, &[gi]).unwrap();
        state.process_input(amount, &[gi]).unwrap();
        assert_eq!(spent(&state, amount, gi), 2);
        assert!(matches!(
            state.process_input(amount, &[gi]),
            Err(Error::Invariant(_))
        ));
        state.unprocess_input(amount, &[gi]).unwrap();
        state.unprocess_input(amount, &[gi]).unwrap();
        assert_eq!(spent(&state, amount, gi), 0);
    }
}
