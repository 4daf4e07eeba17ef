//! # Summary
//!
//! The replicated application is split into three capabilities, which the
//! engine requires together as `Application`. Applications are shared across
//! every instance on a node, so all methods take `&self` and are keyed by
//! service name.

use serde_derive::{Deserialize, Serialize};

use crate::message::Epoch;

/// Client-assigned request identifier.
pub type RequestId = u64;

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Opaque application command
    App,

    /// Hole filler; decided but never executed
    Noop,

    /// Terminal command of an epoch
    Stop,
}

/// Opaque client command for a single service.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    pub service: String,
    pub epoch: Epoch,
    pub id: RequestId,
    pub payload: Vec<u8>,
    pub kind: Kind,
}

impl Request {
    pub fn new<S: Into<String>>(service: S, epoch: Epoch, id: RequestId, payload: Vec<u8>) -> Self {
        Request {
            service: service.into(),
            epoch,
            id,
            payload,
            kind: Kind::App,
        }
    }

    pub fn noop(service: &str, epoch: Epoch) -> Self {
        Request {
            service: service.to_owned(),
            epoch,
            id: 0,
            payload: Vec::new(),
            kind: Kind::Noop,
        }
    }

    pub fn stop(service: &str, epoch: Epoch, id: RequestId) -> Self {
        Request {
            service: service.to_owned(),
            epoch,
            id,
            payload: Vec::new(),
            kind: Kind::Stop,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == Kind::Noop
    }

    pub fn is_stop(&self) -> bool {
        self.kind == Kind::Stop
    }
}

/// Applies decided requests.
pub trait Executable: Send + Sync + 'static {
    /// Returns false if the request could not be applied; the instance
    /// stalls at this slot and retries later.
    fn execute(&self, request: &Request) -> bool;
}

/// Snapshots and rehydrates per-service state.
pub trait Checkpointable: Send + Sync + 'static {
    fn checkpoint(&self, service: &str) -> Option<Vec<u8>>;
    fn restore(&self, service: &str, state: &[u8]) -> bool;
}

/// Epoch handoff hooks.
pub trait Reconfigurable: Checkpointable {
    fn get_final_state(&self, service: &str, epoch: Epoch) -> Option<Vec<u8>>;
    fn put_initial_state(&self, service: &str, epoch: Epoch, state: &[u8]) -> bool;
    fn delete_final_state(&self, service: &str, epoch: Epoch) -> bool;
    fn get_epoch(&self, service: &str) -> Option<Epoch>;
}

/// Everything the engine needs from the replicated application.
pub trait Application: Executable + Reconfigurable {}

impl<T> Application for T where T: Executable + Reconfigurable {}
