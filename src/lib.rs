//! Multi-instance Paxos with epoch reconfiguration.
//!
//! A node runs one `PaxosManager`, which hosts any number of independent
//! replicated logs, one per `(service, epoch)`. Decided requests are handed
//! to the node's `Application` in slot order. A `Reconfigurator` moves a
//! service between replica groups by stopping one epoch and starting the
//! next with the old epoch's final state.

#[macro_use]
extern crate derivative;

#[macro_use]
extern crate log;

mod acceptor;
mod checkpoint;
mod coordinator;
mod detector;
mod election;
mod instance;
mod internal;
mod slot_log;
mod sync;
mod thread;

pub mod ballot;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod reconfig;
pub mod shared;
pub mod socket;
pub mod state;
pub mod storage;
pub mod threshold;
pub mod transport;

pub use ballot::{Ballot, NodeId};
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::{ErrorKind, PaxosError};
pub use instance::Status;
pub use internal::{Rx, Tx};
pub use manager::PaxosManager;
pub use message::{parse_packet, Body, Epoch, Packet, PacketType, Slot};
pub use reconfig::{EpochState, Reconfigurator, Record};
pub use state::{Application, Checkpointable, Executable, Reconfigurable, Request, RequestId};
pub use storage::{FileStore, InstanceRecord, MemoryStore, RecordStore, Store};
pub use transport::{TcpTransport, Transport};
