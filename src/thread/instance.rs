//! # Summary
//!
//! Drives one `Instance` from its own task. Packets, proposals and queries
//! arrive on a single channel; a ticker handles timeouts. Everything the
//! instance emits is addressed and handed to the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tap::Tap;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::instance::{Instance, Outgoing, Reply, Status};
use crate::internal;
use crate::message::Packet;
use crate::state::Request;
use crate::transport::Transport;

#[derive(Debug)]
pub enum In {
    Packet(Packet),
    Propose(Request, Reply),
    Status(oneshot::Sender<Status>),
    Retire,
    Delete,
}

pub async fn run(
    mut instance: Instance,
    mut rx: internal::Rx<In>,
    transport: Arc<dyn Transport>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let outgoing = tokio::select! {
            message = rx.recv() => match message {
            | Some(In::Packet(packet)) => instance.handle(packet, Instant::now()),
            | Some(In::Propose(request, reply)) => instance.propose(request, Some(reply), Instant::now()),
            | Some(In::Status(reply)) => {
                reply.send(instance.status()).ok();
                continue
            }
            | Some(In::Retire) => instance.retire(),
            | Some(In::Delete) => {
                instance.destroy();
                return
            }
            | None => break,
            },
            _ = ticker.tick() => instance.tick(Instant::now()),
        };
        dispatch(&*transport, &instance, outgoing);
    }
    debug!("{}:{} task on {} exiting", instance.service(), instance.epoch(), transport.id());
}

fn dispatch(transport: &dyn Transport, instance: &Instance, outgoing: Vec<Outgoing>) {
    let sender = transport.id();
    for Outgoing { to, body } in outgoing {
        for member in to {
            let packet = Packet::new(sender, instance.service(), instance.epoch(), body.clone())
                .tap(|packet| trace!("{} sending {} to {}", sender, packet, member));
            transport.send(member, packet);
        }
    }
}
