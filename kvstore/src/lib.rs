//! A replicated key-value store: one string map per service name.
//!
//! Writes travel through Paxos as bincode-encoded `Operation`s. Reads are
//! replicated too (as `Operation::Read`) and answered from the local map once
//! they execute, so a read observes every write decided before it.

use std::collections::BTreeMap;

use hashbrown::HashMap as Map;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use gigapaxos::{Checkpointable, Epoch, Executable, NodeId, Reconfigurable, Request};

pub type Table = BTreeMap<String, String>;

/// Payload of a replicated request.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Put { key: String, value: String },
    Remove { key: String },
    Read,
}

impl Operation {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// What a client asks a server to do.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Create { group: Vec<NodeId> },
    Reconfigure { group: Vec<NodeId> },
    Delete,
    Put { key: String, value: String },
    Remove { key: String },
    Get { key: String },
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRequest {
    pub service: String,
    pub command: Command,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientResponse {
    Done,
    Value(Option<String>),
    Epoch(Epoch),
    Error(String),
}

#[derive(Default)]
pub struct KvStore {
    tables: Mutex<Map<String, Table>>,
    epochs: Mutex<Map<String, Epoch>>,
    finals: Mutex<Map<(String, Epoch), Vec<u8>>>,
}

impl KvStore {
    pub fn get(&self, service: &str, key: &str) -> Option<String> {
        self.tables
            .lock()
            .get(service)
            .and_then(|table| table.get(key))
            .cloned()
    }

    pub fn table(&self, service: &str) -> Option<Table> {
        self.tables.lock().get(service).cloned()
    }

    /// Initial state of a freshly created service.
    pub fn empty_state() -> Vec<u8> {
        bincode::serialize(&Table::new()).unwrap_or_default()
    }
}

impl Executable for KvStore {
    fn execute(&self, request: &Request) -> bool {
        self.epochs.lock().insert(request.service.clone(), request.epoch);
        if request.is_stop() {
            let state = self.checkpoint(&request.service).unwrap_or_else(KvStore::empty_state);
            self.finals.lock().insert((request.service.clone(), request.epoch), state);
            debug!("{}:{} final state saved", request.service, request.epoch);
            return true
        }
        let operation = match bincode::deserialize::<Operation>(&request.payload) {
        | Ok(operation) => operation,
        | Err(error) => {
            warn!("{}: skipping undecodable request {}: {}", request.service, request.id, error);
            return true
        }
        };
        let mut tables = self.tables.lock();
        let table = tables.entry(request.service.clone()).or_default();
        match operation {
        | Operation::Put { key, value } => {
            table.insert(key, value);
        }
        | Operation::Remove { key } => {
            table.remove(&key);
        }
        | Operation::Read => (),
        }
        true
    }
}

impl Checkpointable for KvStore {
    fn checkpoint(&self, service: &str) -> Option<Vec<u8>> {
        let table = self.table(service).unwrap_or_default();
        bincode::serialize(&table).ok()
    }

    fn restore(&self, service: &str, state: &[u8]) -> bool {
        match bincode::deserialize::<Table>(state) {
        | Ok(table) => {
            self.tables.lock().insert(service.to_owned(), table);
            true
        }
        | Err(error) => {
            warn!("{}: cannot restore state: {}", service, error);
            false
        }
        }
    }
}

impl Reconfigurable for KvStore {
    fn get_final_state(&self, service: &str, epoch: Epoch) -> Option<Vec<u8>> {
        self.finals.lock().get(&(service.to_owned(), epoch)).cloned()
    }

    fn put_initial_state(&self, service: &str, epoch: Epoch, state: &[u8]) -> bool {
        if !self.restore(service, state) {
            return false
        }
        self.epochs.lock().insert(service.to_owned(), epoch);
        true
    }

    fn delete_final_state(&self, service: &str, epoch: Epoch) -> bool {
        let removed = self.finals.lock().remove(&(service.to_owned(), epoch)).is_some();
        let current = self.epochs.lock().get(service).copied();
        if current == Some(epoch) {
            self.tables.lock().remove(service);
            self.epochs.lock().remove(service);
        }
        removed
    }

    fn get_epoch(&self, service: &str) -> Option<Epoch> {
        self.epochs.lock().get(service).copied()
    }
}

/// Installs a `fern` logger on stderr; each `v` raises the level by one.
pub fn init_logging(verbose: u8) -> Result<(), log::SetLoggerError> {
    let level = match verbose {
    | 0 => log::LevelFilter::Warn,
    | 1 => log::LevelFilter::Info,
    | 2 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(service: &str, id: u64, operation: Operation) -> Request {
        Request::new(service, 0, id, operation.encode())
    }

    #[test]
    fn operations_apply_per_service() {
        let store = KvStore::default();
        assert!(store.execute(&request("a", 1, Operation::Put { key: "k".into(), value: "1".into() })));
        assert!(store.execute(&request("b", 2, Operation::Put { key: "k".into(), value: "2".into() })));
        assert!(store.execute(&request("a", 3, Operation::Remove { key: "k".into() })));
        assert_eq!(store.get("a", "k"), None);
        assert_eq!(store.get("b", "k"), Some("2".to_owned()));
    }

    #[test]
    fn checkpoint_restores_into_another_replica() {
        let one = KvStore::default();
        one.execute(&request("a", 1, Operation::Put { key: "x".into(), value: "y".into() }));
        let state = one.checkpoint("a").unwrap();

        let two = KvStore::default();
        assert!(two.restore("a", &state));
        assert_eq!(two.table("a"), one.table("a"));
        assert!(!two.restore("a", &[0xff]));
    }

    #[test]
    fn stop_records_final_state_until_dropped() {
        let store = KvStore::default();
        store.execute(&request("a", 1, Operation::Put { key: "x".into(), value: "y".into() }));
        store.execute(&Request::stop("a", 0, 2));
        let state = store.get_final_state("a", 0).unwrap();

        let next = KvStore::default();
        assert!(next.put_initial_state("a", 1, &state));
        assert_eq!(next.get("a", "x"), Some("y".to_owned()));
        assert_eq!(next.get_epoch("a"), Some(1));

        assert!(store.delete_final_state("a", 0));
        assert_eq!(store.get_final_state("a", 0), None);
        assert_eq!(store.table("a"), None);
    }
}
