//! # Summary
//!
//! Wire format shared by every node. A `Packet` is addressed to one
//! `(service, epoch)` instance; node-level traffic (pings, epoch handoff)
//! reuses the same envelope. Packets are serialized with `bincode`.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::ballot::{Ballot, NodeId};
use crate::checkpoint::Checkpoint;
use crate::error::ErrorKind;
use crate::state::Request;

/// Position in an instance's log.
pub type Slot = u64;

/// Generation of a service's replica group.
pub type Epoch = u32;

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub slot: Slot,
    pub request: Request,
}

impl Proposal {
    pub fn new(slot: Slot, request: Request) -> Self {
        Proposal { slot, request }
    }

    pub fn is_stop(&self) -> bool {
        self.request.is_stop()
    }
}

/// A proposal tagged with the ballot it was proposed under.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PValue {
    pub ballot: Ballot,
    pub proposal: Proposal,
}

impl PValue {
    pub fn new(ballot: Ballot, slot: Slot, request: Request) -> Self {
        PValue {
            ballot,
            proposal: Proposal::new(slot, request),
        }
    }

    pub fn slot(&self) -> Slot {
        self.proposal.slot
    }

    pub fn request(&self) -> &Request {
        &self.proposal.request
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// Client request travelling towards the coordinator
    Request { request: Request, hops: u8 },

    /// Phase 1a
    Prepare { ballot: Ballot, first_undecided: Slot },

    /// Phase 1b; `ballot` is the acceptor's ballot after the prepare
    PrepareReply { ballot: Ballot, accepted: Vec<PValue>, gc_slot: Slot },

    /// Phase 2a
    Accept(PValue),

    /// Phase 2b; a `ballot` above the proposal's is a nack
    AcceptReply { ballot: Ballot, slot: Slot },

    Decision(PValue),

    SyncRequest {
        next_slot: Slot,
        max_decided: Option<Slot>,
        missing: Vec<Slot>,
        missing_too_much: bool,
    },

    SyncReply {
        max_decided: Option<Slot>,
        decisions: Vec<PValue>,
        checkpoint: Option<Checkpoint>,
        complete: bool,
    },

    StopEpoch,
    AckStopEpoch,
    RequestEpochFinalState,
    EpochFinalState { state: Vec<u8> },
    StartEpoch { group: Vec<NodeId>, state: Vec<u8> },
    AckStartEpoch,
    DropEpochFinalState,
    AckDropEpochFinalState,

    Ping,
}

/// Discriminant of `Body`.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Request,
    Prepare,
    PrepareReply,
    Accept,
    AcceptReply,
    Decision,
    SyncRequest,
    SyncReply,
    StopEpoch,
    AckStopEpoch,
    RequestEpochFinalState,
    EpochFinalState,
    StartEpoch,
    AckStartEpoch,
    DropEpochFinalState,
    AckDropEpochFinalState,
    Ping,
}

impl PacketType {
    /// Whether packets of this type are handled by a Paxos instance rather
    /// than by the node's manager.
    pub fn is_paxos(&self) -> bool {
        match self {
        | PacketType::Request
        | PacketType::Prepare
        | PacketType::PrepareReply
        | PacketType::Accept
        | PacketType::AcceptReply
        | PacketType::Decision
        | PacketType::SyncRequest
        | PacketType::SyncReply => true,
        | _ => false,
        }
    }
}

impl Body {
    pub fn kind(&self) -> PacketType {
        match self {
        | Body::Request { .. } => PacketType::Request,
        | Body::Prepare { .. } => PacketType::Prepare,
        | Body::PrepareReply { .. } => PacketType::PrepareReply,
        | Body::Accept(_) => PacketType::Accept,
        | Body::AcceptReply { .. } => PacketType::AcceptReply,
        | Body::Decision(_) => PacketType::Decision,
        | Body::SyncRequest { .. } => PacketType::SyncRequest,
        | Body::SyncReply { .. } => PacketType::SyncReply,
        | Body::StopEpoch => PacketType::StopEpoch,
        | Body::AckStopEpoch => PacketType::AckStopEpoch,
        | Body::RequestEpochFinalState => PacketType::RequestEpochFinalState,
        | Body::EpochFinalState { .. } => PacketType::EpochFinalState,
        | Body::StartEpoch { .. } => PacketType::StartEpoch,
        | Body::AckStartEpoch => PacketType::AckStartEpoch,
        | Body::DropEpochFinalState => PacketType::DropEpochFinalState,
        | Body::AckDropEpochFinalState => PacketType::AckDropEpochFinalState,
        | Body::Ping => PacketType::Ping,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub sender: NodeId,
    pub service: String,
    pub epoch: Epoch,
    pub body: Body,
}

impl Packet {
    pub fn new<S: Into<String>>(sender: NodeId, service: S, epoch: Epoch, body: Body) -> Self {
        Packet {
            sender,
            service: service.into(),
            epoch,
            body,
        }
    }

    pub fn kind(&self) -> PacketType {
        self.body.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ErrorKind> {
        bincode::serialize(self).map_err(|error| ErrorKind::Encode(error.to_string()))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:?} from {} for {}:{}", self.kind(), self.sender, self.service, self.epoch)
    }
}

/// Decodes a packet received from the wire.
pub fn parse_packet(bytes: &[u8]) -> Result<Packet, ErrorKind> {
    if bytes.is_empty() {
        return Err(ErrorKind::Empty)
    }
    bincode::deserialize(bytes).map_err(|error| ErrorKind::Malformed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_survives_the_wire() {
        let pvalue = PValue::new(
            Ballot::new(3, 1),
            17,
            Request::new("svc1", 0, 42, b"put x 1".to_vec()),
        );
        let packet = Packet::new(1, "svc1", 0, Body::Accept(pvalue));
        let bytes = packet.encode().unwrap();
        let parsed = parse_packet(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.kind(), PacketType::Accept);
    }

    #[test]
    fn empty_and_truncated_input_is_rejected() {
        assert_eq!(parse_packet(&[]), Err(ErrorKind::Empty));

        let packet = Packet::new(0, "svc1", 2, Body::StartEpoch { group: vec![0, 1, 2], state: vec![9; 16] });
        let bytes = packet.encode().unwrap();
        match parse_packet(&bytes[..bytes.len() / 2]) {
        | Err(ErrorKind::Malformed(_)) => (),
        | other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn only_log_traffic_is_routed_to_instances() {
        assert!(PacketType::Decision.is_paxos());
        assert!(PacketType::SyncReply.is_paxos());
        assert!(!PacketType::StopEpoch.is_paxos());
        assert!(!PacketType::Ping.is_paxos());
    }
}
