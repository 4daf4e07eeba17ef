//! # Summary
//!
//! Coordinator election. Coordinators rotate round-robin over the sorted
//! group, offset per service so that different services spread their
//! coordinators across nodes. A node only runs when the current coordinator
//! looks dead and it is next in line, when the coordinator has been dead long
//! enough that anyone should step in, or when it owns the current ballot but
//! lost its coordinator state in a restart.

use std::time::{Duration, Instant};

use crate::ballot::{Ballot, NodeId};
use crate::detector::FailureDetector;

/// FNV-1a, stable across processes and platforms.
fn service_offset(service: &str) -> u64 {
    service.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Coordinator of ballot `number` for `service` over a sorted, non-empty group.
pub fn round_robin(service: &str, group: &[NodeId], number: u64) -> NodeId {
    debug_assert!(!group.is_empty());
    let index = service_offset(service).wrapping_add(number) % group.len() as u64;
    group[index as usize]
}

/// Ballot every member starts an epoch with; its coordinator starts active.
pub fn initial_ballot(service: &str, group: &[NodeId]) -> Ballot {
    Ballot::new(0, round_robin(service, group, 0))
}

/// Rate limiter and decision procedure for running for coordinator.
#[derive(Debug)]
pub struct Election {
    /// Last time this node ran
    last_run: Option<Instant>,

    /// Minimum spacing between runs; grows with every run
    delay: Duration,

    /// Spacing after a successful election
    base: Duration,

    max: Duration,
}

impl Election {
    pub fn new(base: Duration, max: Duration) -> Self {
        Election {
            last_run: None,
            delay: base,
            base,
            max,
        }
    }

    fn ran_recently(&self, now: Instant) -> bool {
        self.last_run
            .map(|last| now.saturating_duration_since(last) < self.delay)
            .unwrap_or(false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn should_run(
        &self,
        id: NodeId,
        service: &str,
        group: &[NodeId],
        current: Ballot,
        has_coordinator: bool,
        detector: &FailureDetector,
        now: Instant,
    ) -> bool {
        if has_coordinator || self.ran_recently(now) {
            return false
        }
        if current.coordinator == id {
            return true
        }
        if detector.is_up(current.coordinator, now) {
            return false
        }
        round_robin(service, group, current.number + 1) == id
            || detector.is_long_dead(current.coordinator, now)
    }

    /// Records a run and backs off with jitter so that competing candidates
    /// drift apart.
    pub fn ran(&mut self, now: Instant) {
        self.last_run = Some(now);
        let jitter = 1.0 + rand::random::<f32>() / 2.0;
        self.delay = std::cmp::min(self.delay.mul_f32(jitter), self.max);
    }

    pub fn reset(&mut self) {
        self.delay = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_visits_every_member() {
        let group = vec![2, 5, 9];
        let mut seen: Vec<NodeId> = (0..3).map(|n| round_robin("svc1", &group, n)).collect();
        seen.sort();
        assert_eq!(seen, group);
        assert_eq!(round_robin("svc1", &group, 0), round_robin("svc1", &group, 3));
    }

    #[test]
    fn owner_without_coordinator_runs() {
        let detector = FailureDetector::new(1, Duration::from_secs(1));
        let election = Election::new(Duration::from_millis(100), Duration::from_secs(1));
        let ballot = Ballot::new(4, 1);
        let now = Instant::now();
        assert!(election.should_run(1, "svc", &[0, 1, 2], ballot, false, &detector, now));
        assert!(!election.should_run(1, "svc", &[0, 1, 2], ballot, true, &detector, now));
    }

    #[test]
    fn only_next_in_line_runs_while_coordinator_recently_dead() {
        let group = vec![0, 1, 2, 3, 4];
        let election = Election::new(Duration::from_millis(10), Duration::from_secs(1));
        let current = Ballot::new(0, round_robin("svc1", &group, 0));
        let next = round_robin("svc1", &group, 1);

        let runners = |at: Instant| -> Vec<NodeId> {
            group
                .iter()
                .copied()
                .filter(|id| *id != current.coordinator)
                .filter(|id| {
                    let detector = FailureDetector::new(*id, Duration::from_millis(50));
                    election.should_run(*id, "svc1", &group, current, false, &detector, at)
                })
                .collect()
        };

        // Coordinator still presumed alive.
        assert!(runners(Instant::now()).is_empty());

        // Suspected, but not yet long dead.
        assert_eq!(runners(Instant::now() + Duration::from_millis(80)), vec![next]);

        // Long dead: everyone steps in.
        assert_eq!(runners(Instant::now() + Duration::from_millis(400)).len(), group.len() - 1);
    }

    #[test]
    fn runs_are_rate_limited() {
        let detector = FailureDetector::new(1, Duration::from_secs(1));
        let mut election = Election::new(Duration::from_millis(100), Duration::from_secs(1));
        let now = Instant::now();
        election.ran(now);
        assert!(!election.should_run(1, "svc", &[1], Ballot::new(0, 1), false, &detector, now));
        assert!(election.should_run(1, "svc", &[1], Ballot::new(0, 1), false, &detector, now + Duration::from_secs(2)));
    }
}
