//! # Summary
//!
//! Per-instance log of decided values. Decisions may arrive in any order and
//! are buffered until every earlier slot has been decided; `next_slot` is the
//! execution cursor. Entries below the garbage-collection point are dropped
//! once a checkpoint covers them.

use std::collections::BTreeMap;

use crate::error::PaxosError;
use crate::message::{PValue, Slot};

#[derive(Clone, Debug, Default)]
pub struct SlotLog {
    /// Decisions in the retained window, executed or not
    decisions: BTreeMap<Slot, PValue>,

    /// First slot that has not been executed
    next_slot: Slot,
}

impl SlotLog {
    pub fn new(next_slot: Slot) -> Self {
        SlotLog {
            decisions: BTreeMap::new(),
            next_slot,
        }
    }

    pub fn next_slot(&self) -> Slot {
        self.next_slot
    }

    /// Highest slot known to be decided, counting executed slots.
    pub fn max_decided(&self) -> Option<Slot> {
        let executed = self.next_slot.checked_sub(1);
        let buffered = self.decisions.keys().next_back().copied();
        executed.max(buffered)
    }

    /// Lowest slot whose decision is still held.
    pub fn first_retained(&self) -> Slot {
        self.decisions.keys().next().copied().unwrap_or(self.next_slot)
    }

    #[cfg(test)]
    pub fn get(&self, slot: Slot) -> Option<&PValue> {
        self.decisions.get(&slot)
    }

    /// Records a decision. Returns whether it was new; a different request
    /// already decided for the same slot is an invariant violation.
    pub fn insert(&mut self, service: &str, decision: PValue) -> Result<bool, PaxosError> {
        let slot = decision.slot();
        if let Some(existing) = self.decisions.get(&slot) {
            if existing.request() != decision.request() {
                return Err(PaxosError::ConflictingDecision {
                    service: service.to_owned(),
                    slot,
                })
            }
            return Ok(false)
        }
        if slot < self.next_slot {
            return Ok(false)
        }
        self.decisions.insert(slot, decision);
        Ok(true)
    }

    /// The decision at the execution cursor, if it has arrived.
    pub fn next_executable(&self) -> Option<&PValue> {
        self.decisions.get(&self.next_slot)
    }

    pub fn advance(&mut self) {
        self.next_slot += 1;
    }

    /// Undecided slots between the cursor and the highest buffered decision.
    pub fn missing(&self, limit: usize) -> Vec<Slot> {
        let max = match self.decisions.keys().next_back() {
        | Some(max) if *max > self.next_slot => *max,
        | _ => return Vec::new(),
        };
        (self.next_slot..max)
            .filter(|slot| !self.decisions.contains_key(slot))
            .take(limit)
            .collect()
    }

    /// Whether decisions are buffered behind an undecided slot.
    pub fn has_gap(&self) -> bool {
        !self.decisions.contains_key(&self.next_slot)
            && self.decisions.range(self.next_slot..).next().is_some()
    }

    /// Decided values from `from` onwards, at most `limit` of them.
    pub fn decided_from(&self, from: Slot, limit: usize) -> Vec<PValue> {
        self.decisions.range(from..).take(limit).map(|(_, pvalue)| pvalue.clone()).collect()
    }

    /// Drops every decision below `slot`.
    pub fn truncate(&mut self, slot: Slot) {
        self.decisions = self.decisions.split_off(&slot);
    }

    /// Moves the cursor forward to `slot` after a checkpoint restore.
    pub fn jump(&mut self, slot: Slot) {
        if slot > self.next_slot {
            self.next_slot = slot;
        }
        self.truncate(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::Ballot;
    use crate::state::Request;

    fn decision(slot: Slot, id: u64) -> PValue {
        PValue::new(Ballot::new(1, 0), slot, Request::new("svc", 0, id, vec![id as u8]))
    }

    #[test]
    fn buffers_out_of_order_decisions() {
        let mut log = SlotLog::new(0);
        assert!(log.insert("svc", decision(2, 2)).unwrap());
        assert!(log.insert("svc", decision(0, 0)).unwrap());
        assert!(!log.has_gap());

        assert_eq!(log.next_executable().map(PValue::slot), Some(0));
        log.advance();
        assert!(log.next_executable().is_none());
        assert!(log.has_gap());
        assert_eq!(log.missing(10), vec![1]);
        assert_eq!(log.max_decided(), Some(2));
    }

    #[test]
    fn duplicate_is_ignored_and_conflict_is_reported() {
        let mut log = SlotLog::new(0);
        assert!(log.insert("svc", decision(0, 7)).unwrap());
        assert!(!log.insert("svc", decision(0, 7)).unwrap());
        match log.insert("svc", decision(0, 8)) {
        | Err(PaxosError::ConflictingDecision { slot: 0, .. }) => (),
        | other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn same_request_under_different_ballot_is_not_a_conflict() {
        let mut log = SlotLog::new(0);
        log.insert("svc", decision(0, 7)).unwrap();
        let mut later = decision(0, 7);
        later.ballot = Ballot::new(5, 3);
        assert!(!log.insert("svc", later).unwrap());
    }

    #[test]
    fn missing_respects_limit() {
        let mut log = SlotLog::new(0);
        log.insert("svc", decision(10, 10)).unwrap();
        assert_eq!(log.missing(3), vec![0, 1, 2]);
        assert_eq!(log.missing(100).len(), 10);
    }

    #[test]
    fn jump_discards_covered_decisions() {
        let mut log = SlotLog::new(0);
        for slot in 0..6 {
            log.insert("svc", decision(slot, slot)).unwrap();
        }
        log.jump(4);
        assert_eq!(log.next_slot(), 4);
        assert_eq!(log.first_retained(), 4);
        assert!(log.get(3).is_none());
        assert_eq!(log.decided_from(0, 10).len(), 2);

        // Stale decisions below the cursor are not buffered again.
        assert!(!log.insert("svc", decision(1, 1)).unwrap());
    }

    #[test]
    fn empty_log_has_no_max() {
        assert_eq!(SlotLog::new(0).max_decided(), None);
        assert_eq!(SlotLog::new(5).max_decided(), Some(4));
    }
}
