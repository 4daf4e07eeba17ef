use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Unique node identifier.
pub type NodeId = usize;

/// Totally ordered by `number`, then `coordinator`.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    pub number: u64,
    pub coordinator: NodeId,
}

impl Ballot {
    pub fn new(number: u64, coordinator: NodeId) -> Self {
        Ballot { number, coordinator }
    }

    /// Smallest ballot owned by `coordinator` that beats `self`.
    pub fn next(&self, coordinator: NodeId) -> Self {
        Ballot {
            number: self.number + 1,
            coordinator,
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.number, self.coordinator)
    }
}
