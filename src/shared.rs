//! # Summary
//!
//! This module implements an in-process hub that stands in for the network.
//! Every node joins with its ID and gets back a transport plus the receiving
//! end of its inbox. The hub is wrapped in `Arc<RwLock<T>>` so that every
//! node's transport shares the same routing table.
//!
//! Packets are pushed through the wire codec on the way, and the hub can crash
//! nodes or drop selected packets to inject faults.

use std::collections::HashSet as Set;
use std::sync::Arc;

use hashbrown::HashMap as Map;
use parking_lot::RwLock;

use crate::ballot::NodeId;
use crate::internal;
use crate::message::{self, Packet};
use crate::transport::Transport;

/// Returns true for packets that should be dropped; called with `(from, to, packet)`.
pub type Filter = Arc<dyn Fn(NodeId, NodeId, &Packet) -> bool + Send + Sync>;

/// Thread-safe handle to the hub.
#[derive(Clone, Default)]
pub struct LocalNetwork(Arc<RwLock<Hub>>);

#[derive(Default)]
struct Hub {
    inboxes: Map<NodeId, internal::Tx<Packet>>,
    crashed: Set<NodeId>,
    filter: Option<Filter>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Registers `id`, replacing any previous inbox, and revives it if crashed.
    pub fn join(&self, id: NodeId) -> (Arc<LocalTransport>, internal::Rx<Packet>) {
        let (rx, tx) = internal::new();
        let mut hub = self.0.write();
        hub.inboxes.insert(id, tx);
        hub.crashed.remove(&id);
        info!("node {} joined the local network", id);
        let transport = LocalTransport {
            id,
            network: self.clone(),
        };
        (Arc::new(transport), rx)
    }

    /// Cuts `id` off: nothing it sends or should receive is delivered, and its
    /// inbox is closed.
    pub fn crash(&self, id: NodeId) {
        let mut hub = self.0.write();
        hub.crashed.insert(id);
        hub.inboxes.remove(&id);
        info!("node {} crashed", id);
    }

    pub fn is_crashed(&self, id: NodeId) -> bool {
        self.0.read().crashed.contains(&id)
    }

    pub fn set_filter<F>(&self, filter: F)
        where F: Fn(NodeId, NodeId, &Packet) -> bool + Send + Sync + 'static
    {
        self.0.write().filter = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        self.0.write().filter = None;
    }

    fn deliver(&self, from: NodeId, to: NodeId, packet: Packet) {
        let hub = self.0.read();
        if hub.crashed.contains(&from) || hub.crashed.contains(&to) {
            return
        }
        if hub.filter.as_ref().map(|drop| drop(from, to, &packet)).unwrap_or(false) {
            trace!("dropping {} to {}", packet, to);
            return
        }
        let tx = match hub.inboxes.get(&to) {
        | Some(tx) => tx,
        | None => return,
        };
        match packet.encode().and_then(|bytes| message::parse_packet(&bytes)) {
        | Ok(packet) => {
            tx.send(packet);
        }
        | Err(error) => warn!("failed to carry {} to {}: {}", packet, to, error),
        }
    }
}

/// One node's view of the hub.
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, packet: Packet) {
        self.network.deliver(self.id, to, packet);
    }
}
