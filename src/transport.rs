//! # Summary
//!
//! Node-to-node packet delivery. The engine only needs best-effort `send`;
//! transports may drop, duplicate or reorder packets. Incoming packets are
//! handed to the manager through the receiver returned alongside each
//! transport.
//!
//! `TcpTransport` keeps one outbound task per peer that (re)connects on
//! demand, and one accept loop feeding every inbound connection into a
//! single channel. Frames are length-delimited `bincode` packets decoded with
//! `parse_packet`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap as Map;

use crate::ballot::NodeId;
use crate::internal;
use crate::message::Packet;
use crate::thread::peer;

/// Best-effort packet delivery to other nodes, and to self.
pub trait Transport: Send + Sync + 'static {
    fn id(&self) -> NodeId;
    fn send(&self, to: NodeId, packet: Packet);
}

/// Delay before reconnecting to an unreachable peer.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct TcpTransport {
    id: NodeId,
    inbound: internal::Tx<Packet>,
    peers: Map<NodeId, internal::Tx<Packet>>,
}

impl TcpTransport {
    /// Binds this node's address from `addresses` and spawns the accept loop
    /// and one outbound task per peer. Must be called inside a tokio runtime.
    pub async fn bind(
        id: NodeId,
        addresses: &Map<NodeId, SocketAddr>,
    ) -> std::io::Result<(Arc<Self>, internal::Rx<Packet>)> {
        let local = addresses.get(&id).copied().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for node {}", id))
        })?;
        let listener = tokio::net::TcpListener::bind(local).await?;
        info!("node {} listening for peers on {}", id, local);

        let (inbound_rx, inbound_tx) = internal::new();
        tokio::spawn(peer::listen(id, listener, inbound_tx.clone()));

        let mut peers = Map::default();
        for (peer_id, address) in addresses.iter().filter(|(peer_id, _)| **peer_id != id) {
            let (rx, tx) = internal::new();
            tokio::spawn(peer::connect(id, *peer_id, *address, rx, RECONNECT_DELAY));
            peers.insert(*peer_id, tx);
        }

        let transport = TcpTransport {
            id,
            inbound: inbound_tx,
            peers,
        };
        Ok((Arc::new(transport), inbound_rx))
    }
}

impl Transport for TcpTransport {
    fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, packet: Packet) {
        if to == self.id {
            self.inbound.send(packet);
        } else if let Some(tx) = self.peers.get(&to) {
            tx.send(packet);
        } else {
            debug!("no route from {} to {}", self.id, to);
        }
    }
}
