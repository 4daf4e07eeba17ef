use std::time::Duration;

use crate::ballot::NodeId;

/// Per-node engine settings. Built with `Config::new` and `with_*` setters.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique node ID
    pub(crate) id: NodeId,

    /// Period of every instance's housekeeping tick
    pub(crate) tick_interval: Duration,

    /// Silence after which a node is suspected
    pub(crate) failure_timeout: Duration,

    /// Initial Prepare retransmission timeout
    pub(crate) prepare_timeout: Duration,

    /// Initial Accept retransmission timeout
    pub(crate) accept_timeout: Duration,

    /// Upper bound on retransmission timeouts after backoff
    pub(crate) max_timeout: Duration,

    /// Multiplier applied to a timeout on every retransmission
    pub(crate) backoff: f32,

    /// Slots between application checkpoints
    pub(crate) checkpoint_interval: u64,

    /// Distance ahead of the execution cursor that triggers a sync
    pub(crate) out_of_order_limit: u64,

    /// Decisions carried by one sync reply
    pub(crate) max_sync_decisions: usize,

    /// Minimum delay between two sync requests of one instance
    pub(crate) min_resync_delay: Duration,

    /// Period of the sync probe sent by instances without a known gap
    pub(crate) idle_sync_interval: Duration,

    /// Time a client waits for its request to execute
    pub(crate) request_timeout: Duration,

    /// Hops a request may take towards the coordinator
    pub(crate) max_forwards: u8,

    /// Initial resend period of reconfiguration tasks
    pub(crate) reconfigure_period: Duration,

    /// Optional deadline for each reconfiguration step
    pub(crate) reconfigure_timeout: Option<Duration>,

    /// How long a new epoch keeps starting members that missed StartEpoch
    pub(crate) straggler_timeout: Duration,
}

impl Config {
    pub fn new(id: NodeId) -> Self {
        Config {
            id,
            tick_interval: Duration::from_millis(50),
            failure_timeout: Duration::from_secs(2),
            prepare_timeout: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(60),
            backoff: 1.5,
            checkpoint_interval: 400,
            out_of_order_limit: 8,
            max_sync_decisions: 400,
            min_resync_delay: Duration::from_secs(1),
            idle_sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(8),
            max_forwards: 3,
            reconfigure_period: Duration::from_secs(2),
            reconfigure_timeout: None,
            straggler_timeout: Duration::from_secs(60),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_failure_timeout(mut self, failure_timeout: Duration) -> Self {
        self.failure_timeout = failure_timeout;
        self
    }

    pub fn with_prepare_timeout(mut self, prepare_timeout: Duration) -> Self {
        self.prepare_timeout = prepare_timeout;
        self
    }

    pub fn with_accept_timeout(mut self, accept_timeout: Duration) -> Self {
        self.accept_timeout = accept_timeout;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Also caps sync replies at one interval's worth of decisions.
    pub fn with_checkpoint_interval(mut self, checkpoint_interval: u64) -> Self {
        self.checkpoint_interval = checkpoint_interval;
        self.max_sync_decisions = checkpoint_interval.max(1) as usize;
        self
    }

    pub fn with_out_of_order_limit(mut self, out_of_order_limit: u64) -> Self {
        self.out_of_order_limit = out_of_order_limit;
        self
    }

    pub fn with_max_sync_decisions(mut self, max_sync_decisions: usize) -> Self {
        self.max_sync_decisions = max_sync_decisions;
        self
    }

    pub fn with_min_resync_delay(mut self, min_resync_delay: Duration) -> Self {
        self.min_resync_delay = min_resync_delay;
        self
    }

    pub fn with_idle_sync_interval(mut self, idle_sync_interval: Duration) -> Self {
        self.idle_sync_interval = idle_sync_interval;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u8) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    pub fn with_reconfigure_period(mut self, reconfigure_period: Duration) -> Self {
        self.reconfigure_period = reconfigure_period;
        self
    }

    pub fn with_reconfigure_timeout(mut self, reconfigure_timeout: Duration) -> Self {
        self.reconfigure_timeout = Some(reconfigure_timeout);
        self
    }

    pub fn with_straggler_timeout(mut self, straggler_timeout: Duration) -> Self {
        self.straggler_timeout = straggler_timeout;
        self
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        self.failure_timeout / 2
    }

    /// Next retransmission timeout after `current`.
    pub(crate) fn back_off(&self, current: Duration) -> Duration {
        std::cmp::min(current.mul_f32(self.backoff), self.max_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let config = Config::new(0).with_max_timeout(Duration::from_secs(2));
        let mut timeout = Duration::from_secs(1);
        timeout = config.back_off(timeout);
        assert_eq!(timeout, Duration::from_millis(1500));
        timeout = config.back_off(timeout);
        assert_eq!(timeout, Duration::from_secs(2));
    }
}
