//! # Summary
//!
//! Periodic application snapshots. A checkpoint taken after executing slot
//! `s` covers every slot below `s + 1`; once it is stored, the instance may
//! forget decisions and accepted values below the previous checkpoint.

use serde_derive::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::message::Slot;
use crate::state::Application;

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// First slot not covered by this snapshot
    pub next_slot: Slot,

    /// Acceptor ballot when the snapshot was taken
    pub ballot: Ballot,

    /// Opaque application state
    pub state: Vec<u8>,

    /// Taken right after executing the epoch's stop request
    pub last: bool,
}

/// Whether executing `slot` completes a checkpoint interval.
pub fn due(slot: Slot, interval: u64) -> bool {
    interval > 0 && (slot + 1) % interval == 0
}

/// Asks the application for a snapshot of `service` covering slots below `next_slot`.
pub fn take(app: &dyn Application, service: &str, next_slot: Slot, ballot: Ballot, last: bool) -> Option<Checkpoint> {
    app.checkpoint(service).map(|state| Checkpoint {
        next_slot,
        ballot,
        state,
        last,
    })
}
