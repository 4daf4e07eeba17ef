//! # Summary
//!
//! Coordinator state of one Paxos instance: the merged duties of a leader,
//! its scout (phase 1) and its commanders (phase 2). A coordinator starts
//! out `Preparing` under its ballot, becomes `Active` once a majority of
//! acceptors have promised, and from then on assigns slots to requests and
//! counts accept replies per slot.
//!
//! Quorums are tracked the same way for both phases: a set of members that
//! have not answered yet, done once at most a minority is left.

use std::collections::{BTreeMap, VecDeque};
use std::collections::HashSet as Set;
use std::time::{Duration, Instant};

use bimap::BiMap;

use crate::ballot::{Ballot, NodeId};
use crate::config::Config;
use crate::message::{Body, Epoch, PValue, Slot};
use crate::state::{Kind, Request, RequestId};

/// Result of feeding a reply to the coordinator.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Nothing,

    /// A higher ballot exists; the coordinator must step down
    Preempted(Ballot),

    /// Phase 1 finished; broadcast these accepts, fail these requests
    Elected { accepts: Vec<PValue>, refused: Vec<Request> },

    /// A majority accepted this value
    Decided(PValue),
}

/// Result of handing a request to the coordinator.
#[derive(Debug, PartialEq)]
pub enum Proposed {
    /// Broadcast this accept
    Accept(PValue),

    /// Held until phase 1 completes
    Queued,

    /// Already in flight
    Duplicate,

    /// A stop has been proposed; no further requests are taken
    Refused(Request),
}

#[derive(Debug)]
struct Pending {
    pvalue: PValue,
    waiting: Set<NodeId>,
    deadline: Instant,
    timeout: Duration,
}

#[derive(Debug)]
enum Phase {
    Preparing {
        waiting: Set<NodeId>,
        pvalues: BTreeMap<Slot, PValue>,
        gc_slot: Slot,
        deadline: Instant,
        timeout: Duration,
    },
    Active,
}

#[derive(Debug)]
pub struct Coordinator {
    service: String,
    epoch: Epoch,
    ballot: Ballot,
    group: Vec<NodeId>,
    minority: usize,
    phase: Phase,

    /// Execution cursor of the local replica when this ballot was started
    first_undecided: Slot,

    /// Next slot handed to a new proposal
    next_slot: Slot,

    /// Proposals waiting for a majority of accept replies
    pending: BTreeMap<Slot, Pending>,

    /// In-flight requests and the slots they were proposed in
    proposed: BiMap<RequestId, Slot>,

    /// Requests received while preparing
    queued: VecDeque<Request>,

    /// Set once a stop request has been proposed
    stopping: bool,

    accept_timeout: Duration,
}

impl Coordinator {
    /// Starts phase 1 for `ballot`.
    pub fn preparing(
        service: &str,
        epoch: Epoch,
        ballot: Ballot,
        group: &[NodeId],
        first_undecided: Slot,
        config: &Config,
        now: Instant,
    ) -> Self {
        let phase = Phase::Preparing {
            waiting: group.iter().copied().collect(),
            pvalues: BTreeMap::new(),
            gc_slot: 0,
            deadline: now + config.prepare_timeout,
            timeout: config.prepare_timeout,
        };
        debug!("{}:{} preparing {}", service, epoch, ballot);
        Coordinator::with_phase(service, epoch, ballot, group, first_undecided, phase, config)
    }

    /// Skips phase 1; only safe for the initial ballot of a fresh epoch.
    pub fn active(service: &str, epoch: Epoch, ballot: Ballot, group: &[NodeId], next_slot: Slot, config: &Config) -> Self {
        Coordinator::with_phase(service, epoch, ballot, group, next_slot, Phase::Active, config)
    }

    fn with_phase(
        service: &str,
        epoch: Epoch,
        ballot: Ballot,
        group: &[NodeId],
        first_undecided: Slot,
        phase: Phase,
        config: &Config,
    ) -> Self {
        Coordinator {
            service: service.to_owned(),
            epoch,
            ballot,
            group: group.to_vec(),
            minority: (group.len() - 1) / 2,
            phase,
            first_undecided,
            next_slot: first_undecided,
            pending: BTreeMap::new(),
            proposed: BiMap::new(),
            queued: VecDeque::new(),
            stopping: false,
            accept_timeout: config.accept_timeout,
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn is_active(&self) -> bool {
        match self.phase {
        | Phase::Active => true,
        | Phase::Preparing { .. } => false,
        }
    }

    #[cfg(test)]
    pub fn next_slot(&self) -> Slot {
        self.next_slot
    }

    pub fn prepare(&self) -> Body {
        Body::Prepare {
            ballot: self.ballot,
            first_undecided: self.first_undecided,
        }
    }

    /// Counts a promise. Once a majority has promised, every slot from the
    /// first undecided one up to the highest reported is re-proposed with the
    /// highest-ballot value any acceptor reported, or a no-op.
    pub fn handle_prepare_reply(
        &mut self,
        from: NodeId,
        ballot: Ballot,
        accepted: Vec<PValue>,
        acceptor_gc_slot: Slot,
        now: Instant,
    ) -> Outcome {
        if ballot > self.ballot {
            return Outcome::Preempted(ballot)
        }
        if ballot < self.ballot {
            return Outcome::Nothing
        }
        let minority = self.minority;
        let done = match &mut self.phase {
        | Phase::Active => return Outcome::Nothing,
        | Phase::Preparing { waiting, pvalues, gc_slot, .. } => {
            if !waiting.remove(&from) {
                return Outcome::Nothing
            }
            *gc_slot = std::cmp::max(*gc_slot, acceptor_gc_slot);
            for pvalue in accepted {
                let replace = pvalues
                    .get(&pvalue.slot())
                    .map(|known| pvalue.ballot > known.ballot)
                    .unwrap_or(true);
                if replace {
                    pvalues.insert(pvalue.slot(), pvalue);
                }
            }
            waiting.len() <= minority
        }
        };
        if done {
            self.elect(now)
        } else {
            Outcome::Nothing
        }
    }

    fn elect(&mut self, now: Instant) -> Outcome {
        let (pvalues, gc_slot) = match std::mem::replace(&mut self.phase, Phase::Active) {
        | Phase::Preparing { pvalues, gc_slot, .. } => (pvalues, gc_slot),
        | Phase::Active => return Outcome::Nothing,
        };

        // Slots below an acceptor's GC point are decided and checkpointed.
        let start = std::cmp::max(self.first_undecided, gc_slot);
        let end = pvalues
            .keys()
            .next_back()
            .map(|slot| slot + 1)
            .unwrap_or(start)
            .max(start);

        let mut accepts = Vec::with_capacity((end - start) as usize);
        for slot in start..end {
            let request = match pvalues.get(&slot) {
            | Some(pvalue) => pvalue.request().clone(),
            | None => Request::noop(&self.service, self.epoch),
            };
            if request.is_stop() {
                self.stopping = true;
            }
            accepts.push(self.issue(slot, request, now));
        }
        self.next_slot = end;

        let mut refused = Vec::new();
        while let Some(request) = self.queued.pop_front() {
            match self.propose(request, now) {
            | Proposed::Accept(pvalue) => accepts.push(pvalue),
            | Proposed::Refused(request) => refused.push(request),
            | Proposed::Queued
            | Proposed::Duplicate => (),
            }
        }

        info!(
            "{}:{} elected with {}, re-proposing slots {}..{}",
            self.service, self.epoch, self.ballot, start, end,
        );
        Outcome::Elected { accepts, refused }
    }

    fn issue(&mut self, slot: Slot, request: Request, now: Instant) -> PValue {
        if request.kind != Kind::Noop {
            self.proposed.insert(request.id, slot);
        }
        let pvalue = PValue::new(self.ballot, slot, request);
        self.pending.insert(slot, Pending {
            pvalue: pvalue.clone(),
            waiting: self.group.iter().copied().collect(),
            deadline: now + self.accept_timeout,
            timeout: self.accept_timeout,
        });
        pvalue
    }

    /// Assigns the next free slot to `request`, or queues it while preparing.
    pub fn propose(&mut self, request: Request, now: Instant) -> Proposed {
        if self.stopping {
            return Proposed::Refused(request)
        }
        if self.proposed.contains_left(&request.id) {
            return Proposed::Duplicate
        }
        if !self.is_active() {
            if self.queued.iter().any(|queued| queued.id == request.id) {
                return Proposed::Duplicate
            }
            self.queued.push_back(request);
            return Proposed::Queued
        }
        if request.is_stop() {
            info!("{}:{} proposing stop in slot {}", self.service, self.epoch, self.next_slot);
            self.stopping = true;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Proposed::Accept(self.issue(slot, request, now))
    }

    /// Counts an accept reply; `ballot` is the acceptor's ballot.
    pub fn handle_accept_reply(&mut self, from: NodeId, ballot: Ballot, slot: Slot) -> Outcome {
        if ballot > self.ballot {
            return Outcome::Preempted(ballot)
        }
        if ballot < self.ballot {
            return Outcome::Nothing
        }
        let decided = match self.pending.get_mut(&slot) {
        | None => return Outcome::Nothing,
        | Some(pending) => {
            pending.waiting.remove(&from);
            pending.waiting.len() <= self.minority
        }
        };
        if !decided {
            return Outcome::Nothing
        }
        match self.pending.remove(&slot) {
        | Some(pending) => {
            self.proposed.remove_by_right(&slot);
            debug!("{}:{} slot {} decided under {}", self.service, self.epoch, slot, self.ballot);
            Outcome::Decided(pending.pvalue)
        }
        | None => Outcome::Nothing,
        }
    }

    /// Messages whose timeout expired, with the members to resend them to.
    pub fn retransmit(&mut self, config: &Config, now: Instant) -> Vec<(Vec<NodeId>, Body)> {
        let mut resend = Vec::new();
        let prepare = self.prepare();
        if let Phase::Preparing { waiting, deadline, timeout, .. } = &mut self.phase {
            if now >= *deadline {
                *timeout = config.back_off(*timeout);
                *deadline = now + *timeout;
                resend.push((waiting.iter().copied().collect(), prepare));
            }
        }
        for pending in self.pending.values_mut() {
            if now >= pending.deadline {
                pending.timeout = config.back_off(pending.timeout);
                pending.deadline = now + pending.timeout;
                resend.push((
                    pending.waiting.iter().copied().collect(),
                    Body::Accept(pending.pvalue.clone()),
                ));
            }
        }
        if !resend.is_empty() {
            warn!("{}:{} resending {} message(s) under {}", self.service, self.epoch, resend.len(), self.ballot);
        }
        resend
    }

    /// Gives up the ballot, returning every undecided client request.
    pub fn step_down(self) -> Vec<Request> {
        self.pending
            .into_iter()
            .map(|(_, pending)| pending.pvalue.proposal.request)
            .filter(|request| !request.is_noop())
            .chain(self.queued)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(0)
            .with_prepare_timeout(Duration::from_millis(100))
            .with_accept_timeout(Duration::from_millis(100))
    }

    fn request(id: RequestId) -> Request {
        Request::new("svc", 0, id, vec![id as u8])
    }

    fn group() -> Vec<NodeId> {
        vec![0, 1, 2, 3, 4]
    }

    #[test]
    fn decides_after_majority_of_five() {
        let now = Instant::now();
        let mut coordinator = Coordinator::active("svc", 0, Ballot::new(0, 0), &group(), 0, &config());
        let pvalue = match coordinator.propose(request(1), now) {
        | Proposed::Accept(pvalue) => pvalue,
        | other => panic!("expected accept, got {:?}", other),
        };
        assert_eq!(pvalue.slot(), 0);
        assert_eq!(coordinator.next_slot(), 1);

        let ballot = Ballot::new(0, 0);
        assert_eq!(coordinator.handle_accept_reply(0, ballot, 0), Outcome::Nothing);
        assert_eq!(coordinator.handle_accept_reply(0, ballot, 0), Outcome::Nothing);
        assert_eq!(coordinator.handle_accept_reply(3, ballot, 0), Outcome::Nothing);
        assert_eq!(coordinator.handle_accept_reply(4, ballot, 0), Outcome::Decided(pvalue));
        assert_eq!(coordinator.handle_accept_reply(1, ballot, 0), Outcome::Nothing);
    }

    #[test]
    fn higher_ballot_in_reply_preempts() {
        let now = Instant::now();
        let mut coordinator = Coordinator::active("svc", 0, Ballot::new(0, 0), &group(), 0, &config());
        coordinator.propose(request(1), now);
        assert_eq!(
            coordinator.handle_accept_reply(2, Ballot::new(1, 2), 0),
            Outcome::Preempted(Ballot::new(1, 2)),
        );
        assert_eq!(coordinator.step_down(), vec![request(1)]);
    }

    #[test]
    fn election_reproposes_pmax_and_fills_holes() {
        let now = Instant::now();
        let ballot = Ballot::new(2, 1);
        let mut coordinator = Coordinator::preparing("svc", 0, ballot, &group(), 3, &config(), now);
        assert_eq!(coordinator.propose(request(9), now), Proposed::Queued);

        let old = PValue::new(Ballot::new(0, 0), 3, request(3));
        let newer = PValue::new(Ballot::new(1, 4), 3, request(4));
        let far = PValue::new(Ballot::new(0, 0), 5, request(5));

        assert_eq!(coordinator.handle_prepare_reply(0, ballot, vec![old], 0, now), Outcome::Nothing);
        assert_eq!(coordinator.handle_prepare_reply(1, ballot, vec![newer.clone(), far], 0, now), Outcome::Nothing);
        let accepts = match coordinator.handle_prepare_reply(2, ballot, Vec::new(), 0, now) {
        | Outcome::Elected { accepts, refused } => {
            assert!(refused.is_empty());
            accepts
        }
        | other => panic!("expected election, got {:?}", other),
        };

        let summary: Vec<(Slot, Kind, RequestId)> = accepts
            .iter()
            .map(|pvalue| (pvalue.slot(), pvalue.request().kind, pvalue.request().id))
            .collect();
        assert_eq!(summary, vec![
            (3, Kind::App, 4),
            (4, Kind::Noop, 0),
            (5, Kind::App, 5),
            (6, Kind::App, 9),
        ]);
        assert!(accepts.iter().all(|pvalue| pvalue.ballot == ballot));
        assert!(coordinator.is_active());
    }

    #[test]
    fn garbage_collected_slots_are_not_reproposed() {
        let now = Instant::now();
        let ballot = Ballot::new(1, 0);
        let mut coordinator = Coordinator::preparing("svc", 0, ballot, &[0, 1, 2], 0, &config(), now);
        let stale = PValue::new(Ballot::new(0, 2), 1, request(1));
        coordinator.handle_prepare_reply(1, ballot, vec![stale], 0, now);
        match coordinator.handle_prepare_reply(2, ballot, Vec::new(), 4, now) {
        | Outcome::Elected { accepts, .. } => assert!(accepts.is_empty()),
        | other => panic!("expected election, got {:?}", other),
        }
        assert_eq!(coordinator.next_slot(), 4);
    }

    #[test]
    fn stop_refuses_later_requests() {
        let now = Instant::now();
        let mut coordinator = Coordinator::active("svc", 0, Ballot::new(0, 0), &[0], 0, &config());
        assert!(matches!(coordinator.propose(Request::stop("svc", 0, 77), now), Proposed::Accept(_)));
        assert_eq!(coordinator.propose(request(1), now), Proposed::Refused(request(1)));
    }

    #[test]
    fn duplicate_requests_are_not_reproposed() {
        let now = Instant::now();
        let mut coordinator = Coordinator::active("svc", 0, Ballot::new(0, 0), &[0, 1, 2], 0, &config());
        assert!(matches!(coordinator.propose(request(1), now), Proposed::Accept(_)));
        assert_eq!(coordinator.propose(request(1), now), Proposed::Duplicate);
    }

    #[test]
    fn retransmits_to_silent_acceptors_with_backoff() {
        let now = Instant::now();
        let mut coordinator = Coordinator::active("svc", 0, Ballot::new(0, 0), &[0, 1, 2], 0, &config());
        coordinator.propose(request(1), now);
        coordinator.handle_accept_reply(0, Ballot::new(0, 0), 0);
        assert!(coordinator.retransmit(&config(), now).is_empty());

        let later = now + Duration::from_millis(120);
        let resend = coordinator.retransmit(&config(), later);
        assert_eq!(resend.len(), 1);
        let mut targets = resend[0].0.clone();
        targets.sort();
        assert_eq!(targets, vec![1, 2]);

        // Backed off to 150ms, so nothing is due 120ms later.
        assert!(coordinator.retransmit(&config(), later + Duration::from_millis(120)).is_empty());
    }
}
