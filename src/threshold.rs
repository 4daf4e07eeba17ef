//! # Summary
//!
//! A message sent to a set of nodes until enough of them answer. Used for
//! every step of a reconfiguration: stop the old epoch, fetch its final
//! state, start the new epoch, drop the old state.
//!
//! Replies are matched on `(service, epoch, reply kind)` through a channel
//! registered with the manager for as long as the task runs, and only the
//! first reply from each target counts.

use std::time::{Duration, Instant};

use hashbrown::HashMap as Map;

use crate::ballot::NodeId;
use crate::error::PaxosError;
use crate::internal;
use crate::manager::PaxosManager;
use crate::message::{Body, Epoch, Packet, PacketType};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Every pending target on each round
    Broadcast,

    /// One pending target per round, rotating
    Sequential,
}

pub struct ThresholdTask {
    manager: PaxosManager,
    packet: Packet,
    reply: PacketType,
    targets: Vec<NodeId>,
    threshold: usize,
    mode: Mode,
    period: Duration,
    deadline: Option<Duration>,
}

impl ThresholdTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: &PaxosManager,
        service: &str,
        epoch: Epoch,
        body: Body,
        reply: PacketType,
        targets: &[NodeId],
        threshold: usize,
        mode: Mode,
    ) -> Self {
        let config = manager.config();
        ThresholdTask {
            manager: manager.clone(),
            packet: Packet::new(manager.id(), service, epoch, body),
            reply,
            targets: targets.to_vec(),
            threshold: threshold.min(targets.len()),
            mode,
            period: config.reconfigure_period,
            deadline: config.reconfigure_timeout,
        }
    }

    /// Gives up after `deadline` regardless of the configured one.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs until `threshold` distinct targets reply, returning their replies.
    pub async fn run(self) -> Result<Vec<Packet>, PaxosError> {
        if self.threshold == 0 {
            return Ok(Vec::new())
        }
        let key = (self.packet.service.clone(), self.packet.epoch, self.reply);
        let (mut rx, tx) = internal::new();
        let _registration = self.manager.register(key, tx);

        let started = Instant::now();
        let mut replies: Map<NodeId, Packet> = Map::default();
        let mut period = self.period;
        let mut turn = 0;

        loop {
            let pending = self.targets
                .iter()
                .copied()
                .filter(|target| !replies.contains_key(target))
                .collect::<Vec<_>>();
            match self.mode {
            | Mode::Broadcast => for target in &pending {
                self.manager.send(*target, self.packet.clone());
            },
            | Mode::Sequential => if !pending.is_empty() {
                self.manager.send(pending[turn % pending.len()], self.packet.clone());
                turn += 1;
            },
            }

            let resend_at = tokio::time::Instant::now() + period;
            loop {
                match tokio::time::timeout_at(resend_at, rx.recv()).await {
                | Ok(Some(reply)) => {
                    if !self.targets.contains(&reply.sender) || replies.contains_key(&reply.sender) {
                        continue
                    }
                    debug!("{} got {:?} from {}", self.manager.id(), self.reply, reply.sender);
                    replies.insert(reply.sender, reply);
                    if replies.len() >= self.threshold {
                        return Ok(replies.into_iter().map(|(_, reply)| reply).collect())
                    }
                }
                | Ok(None) => return Err(PaxosError::Cancelled),
                | Err(_) => break,
                }
            }

            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    warn!(
                        "{:?} for {}:{} timed out with {} of {} replies",
                        self.packet.kind(), self.packet.service, self.packet.epoch, replies.len(), self.threshold,
                    );
                    return Err(PaxosError::Timeout { coordinator: None })
                }
            }
            period = self.manager.config().back_off(period);
            warn!(
                "resending {:?} for {}:{} ({} of {} replies)",
                self.packet.kind(), self.packet.service, self.packet.epoch, replies.len(), self.threshold,
            );
        }
    }
}
