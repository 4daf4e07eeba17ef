//! # Summary
//!
//! Heartbeat-based failure suspicion shared by every instance on a node.
//! Any packet counts as a heartbeat; the manager pings peers so that quiet
//! groups stay observable.

use std::time::{Duration, Instant};

use hashbrown::HashMap as Map;
use parking_lot::RwLock;

use crate::ballot::NodeId;

/// Multiple of the failure timeout after which anyone may replace a coordinator.
const LONG_DEAD_FACTOR: u32 = 3;

#[derive(Debug)]
pub struct FailureDetector {
    id: NodeId,
    started: Instant,
    timeout: Duration,
    last_heard: RwLock<Map<NodeId, Instant>>,
}

impl FailureDetector {
    pub fn new(id: NodeId, timeout: Duration) -> Self {
        FailureDetector {
            id,
            started: Instant::now(),
            timeout,
            last_heard: RwLock::new(Map::default()),
        }
    }

    pub fn heard_from(&self, node: NodeId) {
        self.heard_at(node, Instant::now());
    }

    pub fn heard_at(&self, node: NodeId, at: Instant) {
        self.last_heard.write().insert(node, at);
    }

    /// Time since `node` was last heard from, or since start if never.
    fn silence(&self, node: NodeId, now: Instant) -> Duration {
        let since = self.last_heard
            .read()
            .get(&node)
            .copied()
            .unwrap_or(self.started);
        now.saturating_duration_since(since)
    }

    pub fn is_up(&self, node: NodeId, now: Instant) -> bool {
        node == self.id || self.silence(node, now) < self.timeout
    }

    pub fn is_long_dead(&self, node: NodeId, now: Instant) -> bool {
        node != self.id && self.silence(node, now) >= self.timeout * LONG_DEAD_FACTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presumed_up_until_first_timeout() {
        let detector = FailureDetector::new(0, Duration::from_millis(100));
        let now = Instant::now();
        assert!(detector.is_up(1, now));
        assert!(!detector.is_up(1, now + Duration::from_millis(150)));
        assert!(!detector.is_long_dead(1, now + Duration::from_millis(150)));
        assert!(detector.is_long_dead(1, now + Duration::from_millis(400)));
    }

    #[test]
    fn heartbeat_revives_and_self_is_always_up() {
        let detector = FailureDetector::new(0, Duration::from_millis(100));
        let later = Instant::now() + Duration::from_secs(10);
        assert!(detector.is_up(0, later));
        detector.heard_from(2);
        assert!(detector.is_up(2, Instant::now()));
    }
}
