//! # Summary
//!
//! This module abstracts over stable storage. To perform failure recovery, Paxos
//! requires that an acceptor's promises and accepted values, and a replica's
//! checkpoint and decision tail, persist between failures.
//!
//! `FileStore` uses `bincode` to serialize one record per instance to the
//! filesystem, and to deserialize it when recovering a process. This is a naive,
//! inefficient implementation that rewrites the whole record from scratch on
//! every save.
//!
//! The same stores also keep the reconfigurator's per-service records.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};

use crate::acceptor::Acceptor;
use crate::ballot::NodeId;
use crate::checkpoint::Checkpoint;
use crate::error::PaxosError;
use crate::message::{Epoch, PValue};
use crate::reconfig::Record;

/// Everything needed to rebuild one instance after a restart.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub service: String,
    pub epoch: Epoch,
    pub group: Vec<NodeId>,
    pub acceptor: Acceptor,
    pub checkpoint: Option<Checkpoint>,

    /// Decisions not covered by `checkpoint`
    pub decisions: Vec<PValue>,

    pub stopped: bool,
}

/// Durable home of instance records, keyed by `(service, epoch)`.
pub trait Store: Send + Sync + 'static {
    fn save(&self, record: &InstanceRecord) -> Result<(), PaxosError>;
    fn load(&self, service: &str, epoch: Epoch) -> Result<Option<InstanceRecord>, PaxosError>;
    fn remove(&self, service: &str, epoch: Epoch) -> Result<(), PaxosError>;
    fn keys(&self) -> Result<Vec<(String, Epoch)>, PaxosError>;
}

/// Durable home of reconfiguration records, one per service.
pub trait RecordStore: Send + Sync + 'static {
    fn save_record(&self, record: &Record) -> Result<(), PaxosError>;
    fn records(&self) -> Result<Vec<Record>, PaxosError>;
}

/// Volatile store; survives a simulated crash as long as the value is kept.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: Mutex<Map<(String, Epoch), InstanceRecord>>,
    records: Mutex<Map<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn save(&self, record: &InstanceRecord) -> Result<(), PaxosError> {
        self.instances.lock().insert((record.service.clone(), record.epoch), record.clone());
        Ok(())
    }

    fn load(&self, service: &str, epoch: Epoch) -> Result<Option<InstanceRecord>, PaxosError> {
        Ok(self.instances.lock().get(&(service.to_owned(), epoch)).cloned())
    }

    fn remove(&self, service: &str, epoch: Epoch) -> Result<(), PaxosError> {
        self.instances.lock().remove(&(service.to_owned(), epoch));
        Ok(())
    }

    fn keys(&self) -> Result<Vec<(String, Epoch)>, PaxosError> {
        Ok(self.instances.lock().keys().cloned().collect())
    }
}

impl RecordStore for MemoryStore {
    fn save_record(&self, record: &Record) -> Result<(), PaxosError> {
        self.records.lock().insert(record.service.clone(), record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<Record>, PaxosError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

const EXTENSION: &str = "paxos";
const RECORD_EXTENSION: &str = "record";

/// One bincode file per instance under a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, PaxosError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    /// Service names are hex-encoded so that any name is a valid file name.
    fn encode(service: &str) -> String {
        service.bytes().map(|byte| format!("{:02x}", byte)).collect()
    }

    fn path(&self, service: &str, epoch: Epoch) -> PathBuf {
        self.dir.join(format!("{}-{}.{}", FileStore::encode(service), epoch, EXTENSION))
    }

    fn record_path(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", FileStore::encode(service), RECORD_EXTENSION))
    }

    /// Replaces `path` atomically: write a staging file, sync, rename.
    fn write<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), PaxosError> {
        let staging = path.with_extension("tmp");
        let file = fs::File::create(&staging)?;
        let mut writer = io::BufWriter::new(file);
        bincode::serialize_into(&mut writer, value)?;
        let file = writer.into_inner().map_err(|error| error.into_error())?;
        file.sync_all()?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PaxosError> {
        let file = match fs::File::open(path) {
        | Ok(file) => file,
        | Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        | Err(error) => return Err(error.into()),
        };
        Ok(Some(bincode::deserialize_from(io::BufReader::new(file))?))
    }

    fn parse(path: &Path) -> Option<(String, Epoch)> {
        if path.extension()?.to_str()? != EXTENSION {
            return None
        }
        let stem = path.file_stem()?.to_str()?;
        let (name, epoch) = stem.rsplit_once('-')?;
        if name.len() % 2 != 0 {
            return None
        }
        let bytes = (0..name.len())
            .step_by(2)
            .map(|index| u8::from_str_radix(&name[index..index + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some((String::from_utf8(bytes).ok()?, epoch.parse().ok()?))
    }
}

impl Store for FileStore {
    fn save(&self, record: &InstanceRecord) -> Result<(), PaxosError> {
        FileStore::write(&self.path(&record.service, record.epoch), record)
    }

    fn load(&self, service: &str, epoch: Epoch) -> Result<Option<InstanceRecord>, PaxosError> {
        FileStore::read(&self.path(service, epoch))
    }

    fn remove(&self, service: &str, epoch: Epoch) -> Result<(), PaxosError> {
        match fs::remove_file(self.path(service, epoch)) {
        | Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error.into()),
        | _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<(String, Epoch)>, PaxosError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            if let Some(key) = FileStore::parse(&entry?.path()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

impl RecordStore for FileStore {
    fn save_record(&self, record: &Record) -> Result<(), PaxosError> {
        FileStore::write(&self.record_path(&record.service), record)
    }

    fn records(&self) -> Result<Vec<Record>, PaxosError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some(RECORD_EXTENSION) {
                continue
            }
            records.extend(FileStore::read::<Record>(&path)?);
        }
        Ok(records)
    }
}
