//! # Summary
//!
//! One Paxos instance: the replicated log of a single `(service, epoch)` on
//! this node. It owns an acceptor, an optional coordinator, the slot log and
//! the latest checkpoint, and is driven entirely by `handle`, `propose` and
//! `tick`. Each call returns the messages to send; state is persisted before
//! they are returned, so nothing leaves the node that stable storage does not
//! already reflect.
//!
//! The instance never blocks and never touches the network itself, which
//! keeps it usable from the async runner in `thread::instance` as well as
//! from deterministic tests.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap as Map;
use rand::seq::SliceRandom;
use tokio::sync::oneshot;

use crate::acceptor::Acceptor;
use crate::ballot::{Ballot, NodeId};
use crate::checkpoint::{self, Checkpoint};
use crate::config::Config;
use crate::coordinator::{Coordinator, Outcome, Proposed};
use crate::detector::FailureDetector;
use crate::election::{self, Election};
use crate::error::PaxosError;
use crate::message::{Body, Epoch, PValue, Packet, Slot};
use crate::slot_log::SlotLog;
use crate::state::{Application, Request, RequestId};
use crate::storage::{InstanceRecord, Store};
use crate::sync::{self, Synchronizer};

/// Resolves once the request has executed locally.
pub type Reply = oneshot::Sender<Result<Slot, PaxosError>>;

/// Node-wide handles shared by every instance.
#[derive(Clone)]
pub struct Context {
    pub id: NodeId,
    pub config: Arc<Config>,
    pub app: Arc<dyn Application>,
    pub store: Arc<dyn Store>,
    pub detector: Arc<FailureDetector>,
}

/// A message addressed to one or more group members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub to: Vec<NodeId>,
    pub body: Body,
}

/// Snapshot of an instance for callers outside its task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub service: String,
    pub epoch: Epoch,
    pub group: Vec<NodeId>,
    pub ballot: Ballot,
    pub coordinating: bool,
    pub next_slot: Slot,
    pub stopped: bool,
    pub halted: bool,
}

pub struct Instance {
    service: String,
    epoch: Epoch,
    group: Vec<NodeId>,
    context: Context,

    acceptor: Acceptor,
    coordinator: Option<Coordinator>,
    log: SlotLog,
    checkpoint: Option<Checkpoint>,
    election: Election,
    sync: Synchronizer,

    /// Local callers waiting for their request to execute
    waiters: Map<RequestId, Vec<Reply>>,

    /// Executed this epoch's stop request
    stopped: bool,

    /// Superseded by a newer epoch on this node; serves sync only
    retired: bool,

    /// Hit an invariant violation
    halted: bool,

    /// Application refused the next slot
    stalled: bool,

    /// Application refused the last checkpoint
    checkpoint_due: bool,

    /// State changed since the last save
    dirty: bool,

    outbox: Vec<Outgoing>,
}

impl Instance {
    /// Starts a fresh instance. The coordinator of the initial ballot begins
    /// active, since no acceptor can have promised anything yet.
    pub fn create(
        context: Context,
        service: &str,
        epoch: Epoch,
        mut group: Vec<NodeId>,
        initial_state: Option<Vec<u8>>,
        now: Instant,
    ) -> Self {
        group.sort_unstable();
        group.dedup();
        let ballot = election::initial_ballot(service, &group);
        let coordinator = if ballot.coordinator == context.id {
            Some(Coordinator::active(service, epoch, ballot, &group, 0, &context.config))
        } else {
            None
        };
        let checkpoint = initial_state.map(|state| Checkpoint {
            next_slot: 0,
            ballot,
            state,
            last: false,
        });
        info!("{}:{} created on {} with group {:?}, coordinator {}", service, epoch, context.id, group, ballot.coordinator);
        let mut instance = Instance::assemble(
            context,
            service,
            epoch,
            group,
            Acceptor::new(ballot),
            coordinator,
            SlotLog::new(0),
            checkpoint,
            false,
            now,
        );
        instance.dirty = true;
        instance.flush();
        instance
    }

    /// Rebuilds an instance from its persisted record. If `resume` is set the
    /// checkpoint is restored into the application and the decision tail is
    /// replayed; otherwise the instance comes back retired.
    pub fn recover(context: Context, record: InstanceRecord, resume: bool, now: Instant) -> Self {
        let InstanceRecord { service, epoch, group, acceptor, checkpoint, decisions, stopped } = record;
        let next_slot = checkpoint.as_ref().map(|checkpoint| checkpoint.next_slot).unwrap_or(0);
        let resume = resume && !stopped;

        if resume {
            if let Some(checkpoint) = &checkpoint {
                if !context.app.restore(&service, &checkpoint.state) {
                    warn!("{}:{} application refused checkpoint at slot {}", service, epoch, next_slot);
                }
            }
        }

        let mut log = SlotLog::new(next_slot);
        for decision in decisions {
            if let Err(error) = log.insert(&service, decision) {
                error!("{}:{} corrupt decision tail: {}", service, epoch, error);
            }
        }

        info!(
            "{}:{} recovered on {} at slot {} with {} decision(s){}",
            service, epoch, context.id, next_slot, log.decided_from(next_slot, usize::MAX).len(),
            if stopped { ", stopped" } else { "" },
        );
        let mut instance = Instance::assemble(context, &service, epoch, group, acceptor, None, log, checkpoint, stopped, now);
        if resume {
            instance.execute_ready(now);
        } else {
            instance.retired = true;
        }
        instance
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        context: Context,
        service: &str,
        epoch: Epoch,
        group: Vec<NodeId>,
        acceptor: Acceptor,
        coordinator: Option<Coordinator>,
        log: SlotLog,
        checkpoint: Option<Checkpoint>,
        stopped: bool,
        now: Instant,
    ) -> Self {
        let election = Election::new(context.config.prepare_timeout, context.config.max_timeout);
        Instance {
            service: service.to_owned(),
            epoch,
            group,
            context,
            acceptor,
            coordinator,
            log,
            checkpoint,
            election,
            sync: Synchronizer::new(now),
            waiters: Map::default(),
            stopped,
            retired: false,
            halted: false,
            stalled: false,
            checkpoint_due: false,
            dirty: false,
            outbox: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn group(&self) -> &[NodeId] {
        &self.group
    }

    pub fn status(&self) -> Status {
        Status {
            service: self.service.clone(),
            epoch: self.epoch,
            group: self.group.clone(),
            ballot: self.acceptor.ballot(),
            coordinating: self.coordinator.as_ref().map(Coordinator::is_active).unwrap_or(false),
            next_slot: self.log.next_slot(),
            stopped: self.stopped,
            halted: self.halted,
        }
    }

    fn config(&self) -> &Config {
        &self.context.config
    }

    fn id(&self) -> NodeId {
        self.context.id
    }

    /// Submits a locally originated request; `reply` resolves when it executes here.
    pub fn propose(&mut self, request: Request, reply: Option<Reply>, now: Instant) -> Vec<Outgoing> {
        self.handle_request(request, 0, reply, now);
        self.flush()
    }

    pub fn handle(&mut self, packet: Packet, now: Instant) -> Vec<Outgoing> {
        trace!("{} received {}", self.id(), packet);
        if self.halted {
            return Vec::new()
        }
        let Packet { sender, body, .. } = packet;
        match body {
        | Body::Request { request, hops } => self.handle_request(request, hops, None, now),
        | Body::Prepare { ballot, first_undecided } => self.handle_prepare(ballot, first_undecided),
        | Body::PrepareReply { ballot, accepted, gc_slot } => self.handle_prepare_reply(sender, ballot, accepted, gc_slot, now),
        | Body::Accept(pvalue) => self.handle_accept(pvalue),
        | Body::AcceptReply { ballot, slot } => self.handle_accept_reply(sender, ballot, slot, now),
        | Body::Decision(pvalue) => self.handle_decision(pvalue, now),
        | Body::SyncRequest { next_slot, max_decided, missing, missing_too_much } => {
            self.handle_sync_request(sender, next_slot, max_decided, &missing, missing_too_much)
        }
        | Body::SyncReply { decisions, checkpoint, complete, .. } => {
            self.handle_sync_reply(sender, decisions, checkpoint, complete, now)
        }
        | other => debug!("{}:{} ignoring {:?}", self.service, self.epoch, other.kind()),
        }
        self.flush()
    }

    /// Periodic housekeeping: retries, resends, elections and sync.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        if self.halted || self.retired {
            return self.flush()
        }
        if self.stalled {
            self.execute_ready(now);
        }
        if self.checkpoint_due {
            self.take_checkpoint(self.stopped);
        }
        if self.stopped {
            return self.flush()
        }

        if let Some(coordinator) = &mut self.coordinator {
            for (to, body) in coordinator.retransmit(&self.context.config, now) {
                self.outbox.push(Outgoing { to, body });
            }
        }

        let ballot = self.acceptor.ballot();
        let has_coordinator = self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.ballot() >= ballot)
            .unwrap_or(false);
        let run = self.election.should_run(
            self.id(),
            &self.service,
            &self.group,
            ballot,
            has_coordinator,
            &self.context.detector,
            now,
        );
        if run {
            self.run_for_coordinator(now);
        }

        let config = &self.context.config;
        let gap = self.log.has_gap() && self.sync.can_request(config, now);
        if gap || self.sync.probe_due(config, now) {
            self.request_sync(None, now);
        }
        self.flush()
    }

    /// Stops taking part in the epoch after a newer one started on this node.
    pub fn retire(&mut self) -> Vec<Outgoing> {
        info!("{}:{} retired on {}", self.service, self.epoch, self.id());
        self.retired = true;
        if let Some(coordinator) = self.coordinator.take() {
            for request in coordinator.step_down() {
                self.fail(request.id, self.stopped_error());
            }
        }
        self.fail_all(self.stopped_error());
        self.flush()
    }

    /// Tears the instance down for good, removing its persisted record.
    pub fn destroy(mut self) {
        self.fail_all(self.stopped_error());
        if let Err(error) = self.context.store.remove(&self.service, self.epoch) {
            warn!("{}:{} failed to remove record: {}", self.service, self.epoch, error);
        }
        info!("{}:{} dropped from {}", self.service, self.epoch, self.id());
    }

    fn handle_request(&mut self, request: Request, hops: u8, reply: Option<Reply>, now: Instant) {
        if self.stopped || self.retired || self.halted {
            if let Some(reply) = reply {
                reply.send(Err(self.stopped_error())).ok();
            }
            return
        }
        if request.epoch != self.epoch {
            if let Some(reply) = reply {
                reply.send(Err(PaxosError::StaleEpoch {
                    service: self.service.clone(),
                    current: self.epoch,
                    requested: request.epoch,
                })).ok();
            }
            return
        }
        if let Some(reply) = reply {
            self.waiters.entry(request.id).or_insert_with(Vec::new).push(reply);
        }

        self.preempt(self.acceptor.ballot());
        if self.coordinator.is_none() && self.acceptor.ballot().coordinator == self.id() {
            self.run_for_coordinator(now);
        }

        if self.coordinator.is_none() {
            return self.forward(request, hops)
        }
        let proposed = match &mut self.coordinator {
        | Some(coordinator) => coordinator.propose(request, now),
        | None => return,
        };

        match proposed {
        | Proposed::Accept(pvalue) => self.broadcast(Body::Accept(pvalue)),
        | Proposed::Refused(request) => self.fail(request.id, self.stopped_error()),
        | Proposed::Queued
        | Proposed::Duplicate => (),
        }
    }

    /// Passes a request on towards the current ballot's coordinator.
    fn forward(&mut self, request: Request, hops: u8) {
        let target = self.acceptor.ballot().coordinator;
        if hops >= self.config().max_forwards {
            warn!("{}:{} dropping request {} after {} hops", self.service, self.epoch, request.id, hops);
            self.fail(request.id, PaxosError::Redirect { coordinator: target, hops });
        } else {
            trace!("{}:{} forwarding request {} to {}", self.service, self.epoch, request.id, target);
            self.send(target, Body::Request { request, hops: hops + 1 });
        }
    }

    fn handle_prepare(&mut self, ballot: Ballot, first_undecided: Slot) {
        let before = self.acceptor.ballot();
        let (current, accepted) = self.acceptor.prepare(ballot, first_undecided);
        if current != before {
            self.dirty = true;
        }
        self.preempt(current);
        let gc_slot = self.acceptor.gc_slot();
        self.send(ballot.coordinator, Body::PrepareReply { ballot: current, accepted, gc_slot });
    }

    fn handle_prepare_reply(&mut self, from: NodeId, ballot: Ballot, accepted: Vec<PValue>, gc_slot: Slot, now: Instant) {
        let outcome = match &mut self.coordinator {
        | Some(coordinator) => coordinator.handle_prepare_reply(from, ballot, accepted, gc_slot, now),
        | None => return,
        };
        self.apply(outcome, now);
    }

    fn handle_accept(&mut self, pvalue: PValue) {
        let before = self.acceptor.ballot();
        match self.acceptor.accept(&pvalue) {
        | Ok(current) => {
            if current == pvalue.ballot || current != before {
                self.dirty = true;
            }
            self.preempt(current);
            self.send(pvalue.ballot.coordinator, Body::AcceptReply { ballot: current, slot: pvalue.slot() });
        }
        | Err(error) => self.halt(error),
        }
    }

    fn handle_accept_reply(&mut self, from: NodeId, ballot: Ballot, slot: Slot, now: Instant) {
        let outcome = match &mut self.coordinator {
        | Some(coordinator) => coordinator.handle_accept_reply(from, ballot, slot),
        | None => return,
        };
        self.apply(outcome, now);
    }

    fn handle_decision(&mut self, pvalue: PValue, now: Instant) {
        self.preempt(pvalue.ballot);
        let slot = pvalue.slot();
        self.commit(pvalue, now);
        if sync::gap_detected(&self.log, slot, self.config())
            && self.log.has_gap()
            && self.sync.can_request(self.config(), now)
        {
            self.request_sync(None, now);
        }
    }

    fn handle_sync_request(
        &mut self,
        from: NodeId,
        next_slot: Slot,
        max_decided: Option<Slot>,
        missing: &[Slot],
        missing_too_much: bool,
    ) {
        let reply = sync::answer(
            &self.log,
            self.checkpoint.as_ref(),
            next_slot,
            max_decided,
            missing,
            missing_too_much,
            self.config().max_sync_decisions,
        );
        if let Some(reply) = reply {
            debug!("{}:{} answering sync request from {} at slot {}", self.service, self.epoch, from, next_slot);
            self.send(from, reply);
        }
    }

    fn handle_sync_reply(
        &mut self,
        from: NodeId,
        decisions: Vec<PValue>,
        checkpoint: Option<Checkpoint>,
        complete: bool,
        now: Instant,
    ) {
        if self.retired {
            return
        }
        if let Some(checkpoint) = checkpoint {
            self.install(checkpoint);
        }
        for decision in decisions {
            match self.log.insert(&self.service, decision) {
            | Ok(inserted) => self.dirty |= inserted,
            | Err(error) => return self.halt(error),
            }
        }
        self.execute_ready(now);
        if !complete && !self.stopped && !self.halted {
            self.request_sync(Some(from), now);
        }
    }

    fn apply(&mut self, outcome: Outcome, now: Instant) {
        match outcome {
        | Outcome::Nothing => (),
        | Outcome::Preempted(ballot) => self.preempt(ballot),
        | Outcome::Elected { accepts, refused } => {
            self.election.reset();
            for pvalue in accepts {
                self.broadcast(Body::Accept(pvalue));
            }
            for request in refused {
                self.fail(request.id, self.stopped_error());
            }
        }
        | Outcome::Decided(pvalue) => {
            self.commit(pvalue.clone(), now);
            self.send_others(Body::Decision(pvalue));
        }
        }
    }

    /// Steps down if `ballot` beats the local coordinator, handing its
    /// undecided requests to the new ballot's coordinator.
    fn preempt(&mut self, ballot: Ballot) {
        let stale = self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.ballot() < ballot)
            .unwrap_or(false);
        if !stale {
            return
        }
        if let Some(coordinator) = self.coordinator.take() {
            info!("{}:{} coordinator {} preempted by {}", self.service, self.epoch, coordinator.ballot(), ballot);
            self.election.reset();
            for request in coordinator.step_down() {
                self.send(ballot.coordinator, Body::Request { request, hops: 0 });
            }
        }
    }

    fn run_for_coordinator(&mut self, now: Instant) {
        let highest = self.coordinator
            .as_ref()
            .map(Coordinator::ballot)
            .unwrap_or_default()
            .max(self.acceptor.ballot());
        let ballot = highest.next(self.id());
        info!("{}:{} {} running for coordinator with {}", self.service, self.epoch, self.id(), ballot);

        let mut coordinator = Coordinator::preparing(
            &self.service,
            self.epoch,
            ballot,
            &self.group,
            self.log.next_slot(),
            &self.context.config,
            now,
        );
        if let Some(previous) = self.coordinator.take() {
            for request in previous.step_down() {
                coordinator.propose(request, now);
            }
        }
        self.election.ran(now);
        self.broadcast(coordinator.prepare());
        self.coordinator = Some(coordinator);
    }

    fn commit(&mut self, pvalue: PValue, now: Instant) {
        match self.log.insert(&self.service, pvalue) {
        | Ok(true) => {
            self.dirty = true;
            self.execute_ready(now);
        }
        | Ok(false) => (),
        | Err(error) => self.halt(error),
        }
    }

    /// Executes decisions in slot order until the next one is missing.
    fn execute_ready(&mut self, now: Instant) {
        if self.halted || self.stopped || self.retired {
            return
        }
        self.stalled = false;
        while let Some(decision) = self.log.next_executable().cloned() {
            let slot = decision.slot();
            let request = decision.proposal.request;
            if !request.is_noop() && !self.context.app.execute(&request) {
                warn!("{}:{} application failed to execute slot {}, retrying", self.service, self.epoch, slot);
                self.stalled = true;
                return
            }
            self.log.advance();
            self.sync.touch(now);
            trace!("{}:{} executed slot {} on {}", self.service, self.epoch, slot, self.id());
            if !request.is_noop() {
                self.notify(request.id, slot);
            }
            if request.is_stop() {
                info!("{}:{} stopped at slot {} on {}", self.service, self.epoch, slot, self.id());
                self.stopped = true;
                self.dirty = true;
                self.take_checkpoint(true);
                if let Some(coordinator) = self.coordinator.take() {
                    for request in coordinator.step_down() {
                        self.fail(request.id, self.stopped_error());
                    }
                }
                self.fail_all(self.stopped_error());
                return
            }
            if checkpoint::due(slot, self.config().checkpoint_interval) {
                self.take_checkpoint(false);
            }
        }
    }

    /// Snapshots the application at the execution cursor and collects
    /// everything below the previous checkpoint.
    fn take_checkpoint(&mut self, last: bool) {
        let next_slot = self.log.next_slot();
        match checkpoint::take(&*self.context.app, &self.service, next_slot, self.acceptor.ballot(), last) {
        | Some(checkpoint) => {
            let gc_slot = self.checkpoint.as_ref().map(|previous| previous.next_slot).unwrap_or(0);
            self.log.truncate(gc_slot);
            self.acceptor.garbage_collect(gc_slot);
            self.checkpoint = Some(checkpoint);
            self.checkpoint_due = false;
            self.dirty = true;
            info!("{}:{} checkpointed at slot {} on {}", self.service, self.epoch, next_slot, self.id());
        }
        | None => {
            warn!("{}:{} application refused checkpoint at slot {}", self.service, self.epoch, next_slot);
            self.checkpoint_due = true;
        }
        }
    }

    /// Adopts a checkpoint received from a peer that is ahead of us.
    fn install(&mut self, checkpoint: Checkpoint) {
        if self.stopped || checkpoint.next_slot <= self.log.next_slot() {
            return
        }
        if !self.context.app.restore(&self.service, &checkpoint.state) {
            warn!("{}:{} application refused transferred checkpoint at slot {}", self.service, self.epoch, checkpoint.next_slot);
            return
        }
        info!("{}:{} restored checkpoint at slot {} on {}", self.service, self.epoch, checkpoint.next_slot, self.id());
        self.log.jump(checkpoint.next_slot);
        self.acceptor.garbage_collect(checkpoint.next_slot);
        let last = checkpoint.last;
        self.checkpoint = Some(checkpoint);
        self.dirty = true;
        if last {
            info!("{}:{} learned it is stopped from a checkpoint", self.service, self.epoch);
            self.stopped = true;
            self.coordinator = None;
            self.fail_all(self.stopped_error());
        }
    }

    fn request_sync(&mut self, target: Option<NodeId>, now: Instant) {
        let target = match target.or_else(|| self.sync_target()) {
        | Some(target) => target,
        | None => return,
        };
        let request = self.sync.request(&self.log, &self.context.config, now);
        debug!("{}:{} requesting sync from {} at slot {}", self.service, self.epoch, target, self.log.next_slot());
        self.send(target, request);
    }

    /// The coordinator, or a random other member when we are coordinator.
    fn sync_target(&self) -> Option<NodeId> {
        let coordinator = self.acceptor.ballot().coordinator;
        if coordinator != self.id() && self.group.contains(&coordinator) {
            return Some(coordinator)
        }
        let others: Vec<NodeId> = self.group.iter().copied().filter(|id| *id != self.id()).collect();
        others.choose(&mut rand::thread_rng()).copied()
    }

    fn halt(&mut self, error: PaxosError) {
        error!("{}:{} halting on {}: {}", self.service, self.epoch, self.id(), error);
        self.halted = true;
        self.coordinator = None;
        self.fail_all(error);
    }

    fn stopped_error(&self) -> PaxosError {
        PaxosError::Stopped {
            service: self.service.clone(),
            epoch: self.epoch,
        }
    }

    fn notify(&mut self, id: RequestId, slot: Slot) {
        for reply in self.waiters.remove(&id).into_iter().flatten() {
            reply.send(Ok(slot)).ok();
        }
    }

    fn fail(&mut self, id: RequestId, error: PaxosError) {
        for reply in self.waiters.remove(&id).into_iter().flatten() {
            reply.send(Err(error.clone())).ok();
        }
    }

    fn fail_all(&mut self, error: PaxosError) {
        for (_, replies) in self.waiters.drain() {
            for reply in replies {
                reply.send(Err(error.clone())).ok();
            }
        }
    }

    fn send(&mut self, to: NodeId, body: Body) {
        self.outbox.push(Outgoing { to: vec![to], body });
    }

    fn send_others(&mut self, body: Body) {
        let id = self.id();
        let to = self.group.iter().copied().filter(|member| *member != id).collect();
        self.outbox.push(Outgoing { to, body });
    }

    fn broadcast(&mut self, body: Body) {
        self.outbox.push(Outgoing { to: self.group.clone(), body });
    }

    fn record(&self) -> InstanceRecord {
        let covered = self.checkpoint.as_ref().map(|checkpoint| checkpoint.next_slot).unwrap_or(0);
        InstanceRecord {
            service: self.service.clone(),
            epoch: self.epoch,
            group: self.group.clone(),
            acceptor: self.acceptor.clone(),
            checkpoint: self.checkpoint.clone(),
            decisions: self.log.decided_from(covered, usize::MAX),
            stopped: self.stopped,
        }
    }

    /// Persists pending changes, then releases the outbox. If the save fails
    /// the messages are withheld.
    fn flush(&mut self) -> Vec<Outgoing> {
        if self.dirty {
            match self.context.store.save(&self.record()) {
            | Ok(()) => self.dirty = false,
            | Err(error) => {
                error!("{}:{} failed to persist, withholding {} message(s): {}", self.service, self.epoch, self.outbox.len(), error);
                self.outbox.clear();
            }
            }
        }
        std::mem::take(&mut self.outbox)
    }
}
