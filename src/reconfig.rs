//! # Summary
//!
//! Moves a service from one replica group to another. The reconfigurator
//! keeps one record per service and walks it through
//! `Active(e) -> Stopping(e) -> Stopped(e) -> Active(e + 1)`:
//!
//! 1. stop epoch `e` on one old member, which commits a stop request;
//! 2. fetch the final state of `e` from one old member;
//! 3. start epoch `e + 1` on a majority of the new group with that state;
//! 4. drop the final state of `e` on a majority of the old group.
//!
//! Every step is idempotent on the receiving side, so a reconfiguration that
//! failed partway can simply be run again. Deletion is steps 1 and 4;
//! creation is step 3.
//!
//! Step 3 returns once a majority has started, but keeps starting the rest
//! of the group in the background until they answer, the service is claimed
//! again, or `straggler_timeout` passes.
//!
//! Records are written to a `RecordStore` before they change in memory, so a
//! restarted reconfigurator picks up where it left off.

use std::collections::HashSet as Set;
use std::sync::Arc;

use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::ballot::NodeId;
use crate::error::PaxosError;
use crate::manager::PaxosManager;
use crate::message::{Body, Epoch, PacketType};
use crate::storage::RecordStore;
use crate::threshold::{Mode, ThresholdTask};

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EpochState {
    Active,
    Stopping,
    Stopped,
    Deleted,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub service: String,
    pub epoch: Epoch,
    pub group: Vec<NodeId>,
    pub state: EpochState,
}

pub struct Reconfigurator {
    manager: PaxosManager,
    store: Arc<dyn RecordStore>,
    records: Mutex<Map<String, Record>>,
    busy: Mutex<Set<String>>,

    /// Background starts of members that missed StartEpoch
    stragglers: Mutex<Map<String, JoinHandle<()>>>,
}

/// Marks a service as being reconfigured until dropped.
struct Claim<'r> {
    busy: &'r Mutex<Set<String>>,
    service: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.service);
    }
}

fn majority(group: &[NodeId]) -> usize {
    group.len() / 2 + 1
}

fn normalize(mut group: Vec<NodeId>) -> Vec<NodeId> {
    group.sort_unstable();
    group.dedup();
    group
}

fn valid(service: &str, group: Vec<NodeId>) -> Result<Vec<NodeId>, PaxosError> {
    match normalize(group) {
    | group if group.is_empty() => Err(PaxosError::EmptyGroup(service.to_owned())),
    | group => Ok(group),
    }
}

impl Drop for Reconfigurator {
    fn drop(&mut self) {
        for (_, task) in self.stragglers.get_mut().drain() {
            task.abort();
        }
    }
}

impl Reconfigurator {
    /// Reloads every record kept in `store`.
    pub fn new(manager: PaxosManager, store: Arc<dyn RecordStore>) -> Result<Self, PaxosError> {
        let records = store
            .records()?
            .into_iter()
            .map(|record| (record.service.clone(), record))
            .collect::<Map<_, _>>();
        if !records.is_empty() {
            info!("node {} reloaded {} service record(s)", manager.id(), records.len());
        }
        Ok(Reconfigurator {
            manager,
            store,
            records: Mutex::new(records),
            busy: Mutex::new(Set::new()),
            stragglers: Mutex::new(Map::default()),
        })
    }

    pub fn record(&self, service: &str) -> Option<Record> {
        self.records.lock().get(service).cloned()
    }

    fn claim(&self, service: &str) -> Result<Claim<'_>, PaxosError> {
        if !self.busy.lock().insert(service.to_owned()) {
            return Err(PaxosError::Busy(service.to_owned()))
        }
        if let Some(task) = self.stragglers.lock().remove(service) {
            task.abort();
        }
        Ok(Claim {
            busy: &self.busy,
            service: service.to_owned(),
        })
    }

    fn put(&self, record: Record) -> Result<(), PaxosError> {
        self.store.save_record(&record)?;
        self.records.lock().insert(record.service.clone(), record);
        Ok(())
    }

    fn set_state(&self, service: &str, state: EpochState) -> Result<(), PaxosError> {
        match self.record(service) {
        | Some(mut record) => {
            debug!("{}:{} {:?} -> {:?}", service, record.epoch, record.state, state);
            record.state = state;
            self.put(record)
        }
        | None => Ok(()),
        }
    }

    fn active(&self, service: &str) -> Result<Record, PaxosError> {
        match self.record(service) {
        | Some(record) if record.state != EpochState::Deleted => Ok(record),
        | _ => Err(PaxosError::UnknownService(service.to_owned())),
        }
    }

    /// Starts `service` on `group` with `initial_state`. A deleted service
    /// may be created again under a fresh epoch.
    pub async fn create(&self, service: &str, group: Vec<NodeId>, initial_state: Vec<u8>) -> Result<(), PaxosError> {
        let group = valid(service, group)?;
        let _claim = self.claim(service)?;
        let epoch = match self.record(service) {
        | Some(record) if record.state == EpochState::Deleted => record.epoch + 1,
        | Some(_) => return Err(PaxosError::AlreadyExists(service.to_owned())),
        | None => 0,
        };
        self.start(service, epoch, &group, initial_state).await?;
        info!("{}:{} created on {:?}", service, epoch, group);
        self.put(Record {
            service: service.to_owned(),
            epoch,
            group,
            state: EpochState::Active,
        })
    }

    /// Moves `service` to `group`, returning the new epoch.
    pub async fn reconfigure(&self, service: &str, group: Vec<NodeId>) -> Result<Epoch, PaxosError> {
        let group = valid(service, group)?;
        let _claim = self.claim(service)?;
        let Record { epoch, group: old, .. } = self.active(service)?;
        info!("{}:{} reconfiguring {:?} -> {:?}", service, epoch, old, group);

        self.set_state(service, EpochState::Stopping)?;
        self.stop(service, epoch, &old).await?;
        self.set_state(service, EpochState::Stopped)?;

        let state = self.final_state(service, epoch, &old).await?;
        self.start(service, epoch + 1, &group, state).await?;
        self.put(Record {
            service: service.to_owned(),
            epoch: epoch + 1,
            group,
            state: EpochState::Active,
        })?;

        self.drop_final_state(service, epoch, &old).await?;
        info!("{}:{} now active", service, epoch + 1);
        Ok(epoch + 1)
    }

    /// Stops `service` and drops its state everywhere.
    pub async fn delete(&self, service: &str) -> Result<(), PaxosError> {
        let _claim = self.claim(service)?;
        let Record { epoch, group, .. } = self.active(service)?;

        self.set_state(service, EpochState::Stopping)?;
        self.stop(service, epoch, &group).await?;
        self.set_state(service, EpochState::Stopped)?;
        self.drop_final_state(service, epoch, &group).await?;
        self.set_state(service, EpochState::Deleted)?;
        info!("{}:{} deleted", service, epoch);
        Ok(())
    }

    async fn stop(&self, service: &str, epoch: Epoch, group: &[NodeId]) -> Result<(), PaxosError> {
        ThresholdTask::new(
            &self.manager,
            service,
            epoch,
            Body::StopEpoch,
            PacketType::AckStopEpoch,
            group,
            1,
            Mode::Sequential,
        )
        .run()
        .await
        .map(drop)
    }

    async fn final_state(&self, service: &str, epoch: Epoch, group: &[NodeId]) -> Result<Vec<u8>, PaxosError> {
        let replies = ThresholdTask::new(
            &self.manager,
            service,
            epoch,
            Body::RequestEpochFinalState,
            PacketType::EpochFinalState,
            group,
            1,
            Mode::Sequential,
        )
        .run()
        .await?;
        replies
            .into_iter()
            .find_map(|reply| match reply.body {
            | Body::EpochFinalState { state } => Some(state),
            | _ => None,
            })
            .ok_or(PaxosError::Cancelled)
    }

    async fn start(&self, service: &str, epoch: Epoch, group: &[NodeId], state: Vec<u8>) -> Result<(), PaxosError> {
        let body = Body::StartEpoch { group: group.to_vec(), state };
        let replies = ThresholdTask::new(
            &self.manager,
            service,
            epoch,
            body.clone(),
            PacketType::AckStartEpoch,
            group,
            majority(group),
            Mode::Broadcast,
        )
        .run()
        .await?;

        let missing = group
            .iter()
            .copied()
            .filter(|member| replies.iter().all(|reply| reply.sender != *member))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(())
        }
        debug!("{}:{} still starting on {:?}", service, epoch, missing);
        let task = ThresholdTask::new(
            &self.manager,
            service,
            epoch,
            body,
            PacketType::AckStartEpoch,
            &missing,
            missing.len(),
            Mode::Broadcast,
        )
        .with_deadline(self.manager.config().straggler_timeout);
        let name = service.to_owned();
        let straggler = tokio::spawn(async move {
            match task.run().await {
            | Ok(_) => info!("{}:{} started on {:?}", name, epoch, missing),
            | Err(error) => warn!("{}:{} never started on {:?}: {}", name, epoch, missing, error),
            }
        });
        if let Some(previous) = self.stragglers.lock().insert(service.to_owned(), straggler) {
            previous.abort();
        }
        Ok(())
    }

    async fn drop_final_state(&self, service: &str, epoch: Epoch, group: &[NodeId]) -> Result<(), PaxosError> {
        ThresholdTask::new(
            &self.manager,
            service,
            epoch,
            Body::DropEpochFinalState,
            PacketType::AckDropEpochFinalState,
            group,
            majority(group),
            Mode::Broadcast,
        )
        .run()
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_groups() {
        assert_eq!(majority(&[0]), 1);
        assert_eq!(majority(&[0, 1, 2]), 2);
        assert_eq!(majority(&[0, 1, 2, 3]), 3);
        assert_eq!(majority(&[0, 1, 2, 3, 4]), 3);
    }

    #[test]
    fn groups_are_sorted_and_deduplicated() {
        assert_eq!(normalize(vec![3, 1, 3, 0]), vec![0, 1, 3]);
    }

    #[test]
    fn empty_groups_are_rejected() {
        assert_eq!(valid("kv", Vec::new()), Err(PaxosError::EmptyGroup("kv".to_owned())));
        assert_eq!(valid("kv", vec![2, 2]), Ok(vec![2]));
    }
}
