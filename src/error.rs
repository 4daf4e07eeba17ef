//! # Summary
//!
//! Error types surfaced by the engine. `ErrorKind` is confined to the wire
//! boundary (`parse_packet` and `Packet::encode`); everything else reports a
//! `PaxosError`.

use thiserror::Error;

use crate::ballot::{Ballot, NodeId};
use crate::message::{Epoch, Slot};

/// Failure to turn bytes into a packet or back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("empty packet")]
    Empty,

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("failed to encode packet: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaxosError {
    #[error("no instance for service {0}")]
    UnknownService(String),

    #[error("service {0} already exists")]
    AlreadyExists(String),

    #[error("service {0} is already being reconfigured")]
    Busy(String),

    #[error("service {0} needs at least one member")]
    EmptyGroup(String),

    #[error("node {node} is not a member of {service}")]
    NotMember { service: String, node: NodeId },

    #[error("{service} is at epoch {current}, not {requested}")]
    StaleEpoch {
        service: String,
        current: Epoch,
        requested: Epoch,
    },

    #[error("{service}:{epoch} is stopped")]
    Stopped { service: String, epoch: Epoch },

    #[error("request timed out (coordinator {coordinator:?})")]
    Timeout { coordinator: Option<NodeId> },

    #[error("request dropped after {hops} forwards (coordinator {coordinator})")]
    Redirect { coordinator: NodeId, hops: u8 },

    #[error("conflicting decisions for {service} slot {slot}")]
    ConflictingDecision { service: String, slot: Slot },

    #[error("conflicting accepts for slot {slot} under ballot {ballot}")]
    ConflictingAccept { slot: Slot, ballot: Ballot },

    #[error("application rejected {0}")]
    Application(String),

    #[error("instance was torn down")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Codec(#[from] ErrorKind),
}

impl From<std::io::Error> for PaxosError {
    fn from(error: std::io::Error) -> Self {
        PaxosError::Storage(error.to_string())
    }
}

impl From<bincode::Error> for PaxosError {
    fn from(error: bincode::Error) -> Self {
        PaxosError::Storage(error.to_string())
    }
}
