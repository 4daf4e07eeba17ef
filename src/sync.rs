//! # Summary
//!
//! Log synchronization for replicas that missed decisions. A lagging
//! instance asks a peer for everything it is missing; the peer answers from
//! its own log, and attaches its latest checkpoint when the requested slots
//! have already been garbage collected or the gap is too large to replay.
//! Only decided values ever travel this way.

use std::collections::HashSet as Set;
use std::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::message::{Body, Slot};
use crate::slot_log::SlotLog;

/// Whether seeing a decision or accept for slot `seen` reveals a gap worth syncing.
pub fn gap_detected(log: &SlotLog, seen: Slot, config: &Config) -> bool {
    let expected = log.next_slot();
    if seen <= expected {
        return false
    }
    seen - expected >= config.out_of_order_limit || expected <= 1
}

/// Rate limiting state for outgoing sync requests.
#[derive(Debug)]
pub struct Synchronizer {
    last_request: Option<Instant>,
    last_activity: Instant,
}

impl Synchronizer {
    pub fn new(now: Instant) -> Self {
        Synchronizer {
            last_request: None,
            last_activity: now,
        }
    }

    pub fn can_request(&self, config: &Config, now: Instant) -> bool {
        self.last_request
            .map(|last| now.saturating_duration_since(last) >= config.min_resync_delay)
            .unwrap_or(true)
    }

    /// Whether an instance without a known gap should probe a peer.
    pub fn probe_due(&self, config: &Config, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= config.idle_sync_interval
    }

    /// Progress was made without syncing; postpones the next probe.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn request(&mut self, log: &SlotLog, config: &Config, now: Instant) -> Body {
        self.last_request = Some(now);
        self.last_activity = now;
        let next_slot = log.next_slot();
        let max_decided = log.max_decided();
        let missing_too_much = max_decided
            .map(|max| max.saturating_sub(next_slot) > config.max_sync_decisions as u64)
            .unwrap_or(false);
        Body::SyncRequest {
            next_slot,
            max_decided,
            missing: log.missing(config.max_sync_decisions),
            missing_too_much,
        }
    }
}

/// Builds the reply to a sync request, or nothing if this replica cannot help.
pub fn answer(
    log: &SlotLog,
    checkpoint: Option<&Checkpoint>,
    next_slot: Slot,
    max_decided: Option<Slot>,
    missing: &[Slot],
    missing_too_much: bool,
    limit: usize,
) -> Option<Body> {
    let mine = log.max_decided();
    let checkpoint = checkpoint
        .filter(|checkpoint| checkpoint.next_slot > next_slot)
        .filter(|_| missing_too_much || next_slot < log.first_retained())
        .cloned();

    let from = checkpoint
        .as_ref()
        .map(|checkpoint| checkpoint.next_slot)
        .unwrap_or(next_slot);

    let missing: Set<Slot> = missing.iter().copied().collect();
    let wanted = |slot: Slot| match max_decided {
    | Some(theirs) => slot > theirs || missing.contains(&slot),
    | None => true,
    };

    let mut decisions: Vec<_> = log
        .decided_from(from, usize::MAX)
        .into_iter()
        .filter(|pvalue| wanted(pvalue.slot()))
        .take(limit + 1)
        .collect();
    let complete = decisions.len() <= limit;
    decisions.truncate(limit);

    if decisions.is_empty() && checkpoint.is_none() {
        return None
    }
    Some(Body::SyncReply {
        max_decided: mine,
        decisions,
        checkpoint,
        complete,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ballot::Ballot;
    use crate::message::PValue;
    use crate::state::Request;

    fn log_with(slots: std::ops::Range<Slot>, executed: Slot) -> SlotLog {
        let mut log = SlotLog::new(slots.start);
        for slot in slots {
            log.insert("svc", PValue::new(Ballot::new(0, 0), slot, Request::new("svc", 0, slot, Vec::new())))
                .unwrap();
        }
        while log.next_slot() < executed {
            log.advance();
        }
        log
    }

    fn slots(body: &Body) -> Vec<Slot> {
        match body {
        | Body::SyncReply { decisions, .. } => decisions.iter().map(PValue::slot).collect(),
        | other => panic!("expected sync reply, got {:?}", other),
        }
    }

    #[test]
    fn gap_detection_thresholds() {
        let config = Config::new(0).with_out_of_order_limit(4);
        let log = log_with(0..0, 0);
        assert!(!gap_detected(&log, 0, &config));
        assert!(gap_detected(&log, 1, &config));

        let log = log_with(0..10, 10);
        assert!(!gap_detected(&log, 12, &config));
        assert!(gap_detected(&log, 14, &config));
    }

    #[test]
    fn answers_only_missing_and_newer_slots() {
        let log = log_with(0..10, 10);
        let reply = answer(&log, None, 2, Some(6), &[3, 5], false, 100).unwrap();
        assert_eq!(slots(&reply), vec![3, 5, 7, 8, 9]);
    }

    #[test]
    fn bounded_reply_is_incomplete() {
        let log = log_with(0..10, 10);
        let reply = answer(&log, None, 0, None, &[], false, 4).unwrap();
        assert_eq!(slots(&reply), vec![0, 1, 2, 3]);
        assert!(matches!(reply, Body::SyncReply { complete: false, .. }));

        let reply = answer(&log, None, 6, None, &[], false, 4).unwrap();
        assert!(matches!(reply, Body::SyncReply { complete: true, .. }));
    }

    #[test]
    fn includes_checkpoint_when_slots_were_collected() {
        let mut log = log_with(0..12, 12);
        log.truncate(8);
        let checkpoint = Checkpoint {
            next_slot: 8,
            ballot: Ballot::new(0, 0),
            state: vec![1, 2, 3],
            last: false,
        };
        let reply = answer(&log, Some(&checkpoint), 3, Some(5), &[], false, 100).unwrap();
        match &reply {
        | Body::SyncReply { checkpoint: Some(sent), .. } => assert_eq!(sent.next_slot, 8),
        | other => panic!("expected checkpoint, got {:?}", other),
        }
        assert_eq!(slots(&reply), vec![8, 9, 10, 11]);
    }

    #[test]
    fn nothing_to_offer() {
        let log = log_with(0..4, 4);
        assert!(answer(&log, None, 4, Some(3), &[], false, 10).is_none());
        assert!(answer(&SlotLog::new(0), None, 0, None, &[], false, 10).is_none());
    }

    #[test]
    fn requests_are_rate_limited() {
        let config = Config::new(0).with_min_resync_delay(Duration::from_millis(100));
        let now = Instant::now();
        let mut sync = Synchronizer::new(now);
        assert!(sync.can_request(&config, now));
        sync.request(&SlotLog::new(0), &config, now);
        assert!(!sync.can_request(&config, now + Duration::from_millis(50)));
        assert!(sync.can_request(&config, now + Duration::from_millis(100)));
    }
}
