//! Long-running tasks: one per Paxos instance, plus the peer connection
//! loops behind `TcpTransport`.

pub(crate) mod instance;
pub(crate) mod peer;
