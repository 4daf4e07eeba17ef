//! # Summary
//!
//! This module defines the `Acceptor` struct, which acts as Paxos's
//! distributed memory. Acceptors keep track of the highest ballot they have
//! seen and what value has been accepted for each slot. The whole struct is
//! persisted before any reply leaves the instance.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::error::PaxosError;
use crate::message::{PValue, Slot};

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Acceptor {
    /// Highest ballot seen
    ballot: Ballot,

    /// Most recently accepted PValue per slot
    accepted: BTreeMap<Slot, PValue>,

    /// Slots below this have been garbage collected
    gc_slot: Slot,
}

impl Acceptor {
    pub fn new(ballot: Ballot) -> Self {
        Acceptor {
            ballot,
            accepted: BTreeMap::new(),
            gc_slot: 0,
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn gc_slot(&self) -> Slot {
        self.gc_slot
    }

    /// Updates highest ballot seen, and returns it with every PValue the
    /// preparing coordinator doesn't know a decision for.
    pub fn prepare(&mut self, ballot: Ballot, first_undecided: Slot) -> (Ballot, Vec<PValue>) {
        self.ballot = std::cmp::max(ballot, self.ballot);
        let accepted = self.accepted
            .range(first_undecided..)
            .map(|(_, pvalue)| pvalue.clone())
            .collect();
        (self.ballot, accepted)
    }

    /// Accepts `pvalue` unless a higher ballot has been seen, and returns the
    /// acceptor's ballot afterwards.
    pub fn accept(&mut self, pvalue: &PValue) -> Result<Ballot, PaxosError> {
        if pvalue.ballot < self.ballot {
            return Ok(self.ballot)
        }
        self.ballot = pvalue.ballot;
        if pvalue.slot() < self.gc_slot {
            return Ok(self.ballot)
        }
        if let Some(previous) = self.accepted.get(&pvalue.slot()) {
            if previous.ballot == pvalue.ballot && previous.proposal != pvalue.proposal {
                return Err(PaxosError::ConflictingAccept {
                    slot: pvalue.slot(),
                    ballot: pvalue.ballot,
                })
            }
        }
        self.accepted.insert(pvalue.slot(), pvalue.clone());
        Ok(self.ballot)
    }

    /// Forgets accepted values below `slot`.
    pub fn garbage_collect(&mut self, slot: Slot) {
        if slot <= self.gc_slot {
            return
        }
        self.accepted = self.accepted.split_off(&slot);
        self.gc_slot = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Request;

    fn pvalue(number: u64, slot: Slot, id: u64) -> PValue {
        PValue::new(Ballot::new(number, 0), slot, Request::new("svc", 0, id, Vec::new()))
    }

    #[test]
    fn rejects_lower_ballot() {
        let mut acceptor = Acceptor::new(Ballot::new(0, 0));
        acceptor.prepare(Ballot::new(3, 2), 0);
        assert_eq!(acceptor.accept(&pvalue(2, 0, 1)).unwrap(), Ballot::new(3, 2));
        let (_, accepted) = acceptor.prepare(Ballot::new(1, 0), 0);
        assert!(accepted.is_empty());
    }

    #[test]
    fn prepare_never_lowers_ballot() {
        let mut acceptor = Acceptor::new(Ballot::new(5, 1));
        let (ballot, _) = acceptor.prepare(Ballot::new(2, 4), 0);
        assert_eq!(ballot, Ballot::new(5, 1));
    }

    #[test]
    fn prepare_reports_only_undecided_slots() {
        let mut acceptor = Acceptor::new(Ballot::new(0, 0));
        for slot in 0..5 {
            acceptor.accept(&pvalue(1, slot, slot)).unwrap();
        }
        let (_, accepted) = acceptor.prepare(Ballot::new(2, 1), 3);
        let slots: Vec<Slot> = accepted.iter().map(PValue::slot).collect();
        assert_eq!(slots, vec![3, 4]);
    }

    #[test]
    fn higher_ballot_overwrites_and_same_ballot_conflict_errors() {
        let mut acceptor = Acceptor::new(Ballot::new(0, 0));
        acceptor.accept(&pvalue(1, 0, 1)).unwrap();
        acceptor.accept(&pvalue(2, 0, 2)).unwrap();
        let (_, accepted) = acceptor.prepare(Ballot::new(2, 0), 0);
        assert_eq!(accepted, vec![pvalue(2, 0, 2)]);

        // Re-delivery is fine, a different value under the same ballot is not.
        assert!(acceptor.accept(&pvalue(2, 0, 2)).is_ok());
        assert!(acceptor.accept(&pvalue(2, 0, 3)).is_err());
    }

    #[test]
    fn garbage_collected_slots_are_acknowledged_but_dropped() {
        let mut acceptor = Acceptor::new(Ballot::new(0, 0));
        for slot in 0..4 {
            acceptor.accept(&pvalue(1, slot, slot)).unwrap();
        }
        acceptor.garbage_collect(2);
        assert_eq!(acceptor.gc_slot(), 2);
        assert_eq!(acceptor.accept(&pvalue(1, 1, 9)).unwrap(), Ballot::new(1, 0));
        let (_, accepted) = acceptor.prepare(Ballot::new(1, 0), 0);
        assert_eq!(accepted.len(), 2);
    }
}
