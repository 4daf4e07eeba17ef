//! # Summary
//!
//! The per-node hub. A `PaxosManager` owns the registry of Paxos instances
//! on this node, routes every inbound packet, answers the node-level
//! reconfiguration messages, and hands client proposals to the right
//! instance.
//!
//! Each instance runs as its own task (see `thread::instance`); the manager
//! only holds a channel to it. Locks guard the registry maps and are held
//! for lookup or insert only, never across an await.
//!
//! Replies to reconfiguration messages are delivered to whichever threshold
//! task registered for `(service, epoch, reply kind)`.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap as Map, HashSet as Set};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::ballot::NodeId;
use crate::config::Config;
use crate::detector::FailureDetector;
use crate::error::PaxosError;
use crate::instance::{Context, Instance, Status};
use crate::internal;
use crate::message::{Body, Epoch, Packet, PacketType, Slot};
use crate::state::{Application, Request};
use crate::storage::Store;
use crate::thread::instance::{self as runner, In};
use crate::transport::Transport;

/// Reply channel key of a threshold task.
pub type TaskKey = (String, Epoch, PacketType);

/// Channel to a running instance.
#[derive(Clone, Debug)]
struct Handle {
    epoch: Epoch,
    group: Vec<NodeId>,
    tx: internal::Tx<In>,
}

#[derive(Clone)]
pub struct PaxosManager(Arc<Inner>);

struct Inner {
    context: Context,
    transport: Arc<dyn Transport>,

    /// Current instance of each service
    instances: RwLock<Map<String, Handle>>,

    /// Superseded epochs kept around to serve sync until dropped
    retired: RwLock<Map<(String, Epoch), Handle>>,

    /// Reply channels of running threshold tasks
    tasks: Mutex<Map<TaskKey, internal::Tx<Packet>>>,

    /// Epochs whose final state was dropped here
    dropped: Mutex<Set<(String, Epoch)>>,
}

/// Unregisters a threshold task's reply channel when dropped.
pub(crate) struct Registration {
    manager: PaxosManager,
    key: TaskKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.0.tasks.lock().remove(&self.key);
    }
}

impl PaxosManager {
    pub fn new(
        config: Config,
        app: Arc<dyn Application>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let id = transport.id();
        if config.id() != id {
            warn!("config names node {} but transport is node {}; using {}", config.id(), id, id);
        }
        let detector = Arc::new(FailureDetector::new(id, config.failure_timeout));
        let context = Context {
            id,
            config: Arc::new(config),
            app,
            store,
            detector,
        };
        PaxosManager(Arc::new(Inner {
            context,
            transport,
            instances: RwLock::new(Map::default()),
            retired: RwLock::new(Map::default()),
            tasks: Mutex::new(Map::default()),
            dropped: Mutex::new(Set::default()),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.context.id
    }

    pub fn config(&self) -> &Config {
        &self.0.context.config
    }

    pub fn app(&self) -> &Arc<dyn Application> {
        &self.0.context.app
    }

    /// Creates the instance of `(service, epoch)` on this node, retiring the
    /// previous epoch. Returns false if it already exists. Must be called
    /// inside a tokio runtime.
    pub fn get_or_create_instance(
        &self,
        service: &str,
        epoch: Epoch,
        group: Vec<NodeId>,
        initial_state: Option<Vec<u8>>,
    ) -> Result<bool, PaxosError> {
        let id = self.id();
        if !group.contains(&id) {
            return Err(PaxosError::NotMember { service: service.to_owned(), node: id })
        }

        let mut instances = self.0.instances.write();
        if let Some(existing) = instances.get(service) {
            if existing.epoch == epoch {
                return Ok(false)
            }
            if existing.epoch > epoch {
                return Err(PaxosError::StaleEpoch {
                    service: service.to_owned(),
                    current: existing.epoch,
                    requested: epoch,
                })
            }
        }
        let key = (service.to_owned(), epoch);
        if self.0.retired.read().contains_key(&key) {
            return Ok(false)
        }
        if self.0.dropped.lock().contains(&key) {
            debug!("{}:{} was dropped on {}; not starting it again", service, epoch, id);
            return Ok(false)
        }

        if let Some(state) = &initial_state {
            if !self.0.context.app.put_initial_state(service, epoch, state) {
                return Err(PaxosError::Application(format!("{}:{} refused its initial state", service, epoch)))
            }
        }

        let instance = Instance::create(self.0.context.clone(), service, epoch, group, initial_state, Instant::now());
        let handle = self.spawn(instance);
        if let Some(previous) = instances.insert(service.to_owned(), handle) {
            previous.tx.send(In::Retire);
            self.0.retired.write().insert((service.to_owned(), previous.epoch), previous);
        }
        Ok(true)
    }

    fn spawn(&self, instance: Instance) -> Handle {
        let (rx, tx) = internal::new();
        let handle = Handle {
            epoch: instance.epoch(),
            group: instance.group().to_vec(),
            tx,
        };
        tokio::spawn(runner::run(
            instance,
            rx,
            self.0.transport.clone(),
            self.0.context.config.tick_interval,
        ));
        handle
    }

    /// The instance of `(service, epoch)`, current or retired.
    fn lookup(&self, service: &str, epoch: Epoch) -> Option<Handle> {
        if let Some(handle) = self.0.instances.read().get(service) {
            if handle.epoch == epoch {
                return Some(handle.clone())
            }
        }
        self.0.retired.read().get(&(service.to_owned(), epoch)).cloned()
    }

    fn current(&self, service: &str) -> Result<Handle, PaxosError> {
        self.0.instances
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| PaxosError::UnknownService(service.to_owned()))
    }

    /// Current epoch of every service hosted here.
    pub fn services(&self) -> Vec<(String, Epoch)> {
        let mut services = self.0.instances
            .read()
            .iter()
            .map(|(service, handle)| (service.clone(), handle.epoch))
            .collect::<Vec<_>>();
        services.sort();
        services
    }

    /// Tears down every epoch of `service` on this node, including the
    /// persisted records. Returns false if nothing was hosted.
    pub fn remove_instance(&self, service: &str) -> bool {
        let mut removed = Vec::new();
        removed.extend(self.0.instances.write().remove(service));
        self.0.retired.write().retain(|(name, _), handle| {
            if name == service {
                removed.push(handle.clone());
                false
            } else {
                true
            }
        });
        for handle in &removed {
            handle.tx.send(In::Delete);
        }
        !removed.is_empty()
    }

    /// Tears down one epoch of `service`, current or retired, and keeps it
    /// from being created again.
    fn remove_epoch(&self, service: &str, epoch: Epoch) {
        let key = (service.to_owned(), epoch);
        self.0.dropped.lock().insert(key.clone());
        let mut removed = self.0.retired.write().remove(&key);
        {
            let mut instances = self.0.instances.write();
            if instances.get(service).map(|handle| handle.epoch == epoch).unwrap_or(false) {
                removed = instances.remove(service);
            }
        }
        match removed {
        | Some(handle) => {
            handle.tx.send(In::Delete);
        }
        | None => if let Err(error) = self.0.context.store.remove(service, epoch) {
            warn!("{}:{} failed to remove record: {}", service, epoch, error);
        },
        }
    }

    /// Dispatches one inbound packet.
    pub fn route_message(&self, packet: Packet) {
        trace!("{} received {}", self.id(), packet);
        self.0.context.detector.heard_from(packet.sender);
        let kind = packet.kind();
        if kind.is_paxos() {
            match self.lookup(&packet.service, packet.epoch) {
            | Some(handle) => {
                handle.tx.send(In::Packet(packet));
            }
            | None => trace!("{} has no instance for {}", self.id(), packet),
            }
            return
        }
        match kind {
        | PacketType::Ping => (),
        | PacketType::StopEpoch => self.handle_stop_epoch(packet),
        | PacketType::RequestEpochFinalState => self.handle_request_final_state(packet),
        | PacketType::StartEpoch => self.handle_start_epoch(packet),
        | PacketType::DropEpochFinalState => self.handle_drop_final_state(packet),
        | PacketType::AckStopEpoch
        | PacketType::EpochFinalState
        | PacketType::AckStartEpoch
        | PacketType::AckDropEpochFinalState => self.complete_task(packet),
        | _ => debug!("{} ignoring {}", self.id(), packet),
        }
    }

    fn handle_stop_epoch(&self, packet: Packet) {
        let Packet { sender, service, epoch, .. } = packet;
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.propose_stop(&service, epoch).await {
            | Ok(slot) => {
                info!("{}:{} stopped at slot {} on {}", service, epoch, slot, manager.id());
                manager.reply(sender, &service, epoch, Body::AckStopEpoch);
            }
            | Err(PaxosError::Stopped { .. }) => manager.reply(sender, &service, epoch, Body::AckStopEpoch),
            | Err(_) if manager.app().get_final_state(&service, epoch).is_some() => {
                manager.reply(sender, &service, epoch, Body::AckStopEpoch)
            }
            | Err(error) => debug!("{}:{} stop not acknowledged by {}: {}", service, epoch, manager.id(), error),
            }
        });
    }

    fn handle_request_final_state(&self, packet: Packet) {
        match self.app().get_final_state(&packet.service, packet.epoch) {
        | Some(state) => self.reply(packet.sender, &packet.service, packet.epoch, Body::EpochFinalState { state }),
        | None => debug!("{} has no final state for {}:{}", self.id(), packet.service, packet.epoch),
        }
    }

    fn handle_start_epoch(&self, packet: Packet) {
        let Packet { sender, service, epoch, body } = packet;
        let (group, state) = match body {
        | Body::StartEpoch { group, state } => (group, state),
        | _ => return,
        };
        match self.get_or_create_instance(&service, epoch, group, Some(state)) {
        | Ok(created) => {
            if created {
                info!("{}:{} started on {}", service, epoch, self.id());
            }
            self.reply(sender, &service, epoch, Body::AckStartEpoch);
        }
        | Err(PaxosError::StaleEpoch { current, .. }) => {
            debug!("{}:{} already superseded by epoch {} on {}", service, epoch, current, self.id());
            self.reply(sender, &service, epoch, Body::AckStartEpoch);
        }
        | Err(error) => warn!("{}:{} failed to start on {}: {}", service, epoch, self.id(), error),
        }
    }

    fn handle_drop_final_state(&self, packet: Packet) {
        let Packet { sender, service, epoch, .. } = packet;
        if !self.app().delete_final_state(&service, epoch) {
            warn!("{}:{} application failed to delete its final state on {}", service, epoch, self.id());
        }
        self.remove_epoch(&service, epoch);
        info!("{}:{} final state dropped on {}", service, epoch, self.id());
        self.reply(sender, &service, epoch, Body::AckDropEpochFinalState);
    }

    fn complete_task(&self, packet: Packet) {
        let key = (packet.service.clone(), packet.epoch, packet.kind());
        match self.0.tasks.lock().get(&key) {
        | Some(tx) => {
            tx.send(packet);
        }
        | None => trace!("{} discarding late {}", self.id(), packet),
        }
    }

    pub(crate) fn register(&self, key: TaskKey, tx: internal::Tx<Packet>) -> Registration {
        self.0.tasks.lock().insert(key.clone(), tx);
        Registration {
            manager: self.clone(),
            key,
        }
    }

    pub(crate) fn send(&self, to: NodeId, packet: Packet) {
        self.0.transport.send(to, packet);
    }

    fn reply(&self, to: NodeId, service: &str, epoch: Epoch, body: Body) {
        self.send(to, Packet::new(self.id(), service, epoch, body));
    }

    /// Replicates `payload` through the current epoch of `service` and
    /// resolves once it has executed on this node.
    pub async fn propose(&self, service: &str, payload: Vec<u8>) -> Result<Slot, PaxosError> {
        let handle = self.current(service)?;
        let request = Request::new(service, handle.epoch, rand::random(), payload);
        self.submit(&handle, request).await
    }

    /// Like `propose`, with a caller-chosen request ID and epoch so that
    /// retries are recognized as duplicates.
    pub async fn propose_request(&self, request: Request) -> Result<Slot, PaxosError> {
        let handle = self.lookup(&request.service, request.epoch)
            .ok_or_else(|| self.missing(&request.service, request.epoch))?;
        self.submit(&handle, request).await
    }

    /// Proposes the stop request of `(service, epoch)`, after which the
    /// epoch decides nothing further.
    pub async fn propose_stop(&self, service: &str, epoch: Epoch) -> Result<Slot, PaxosError> {
        let handle = match self.lookup(service, epoch) {
        | Some(handle) => handle,
        | None => return Err(self.missing(service, epoch)),
        };
        self.submit(&handle, Request::stop(service, epoch, rand::random())).await
    }

    fn missing(&self, service: &str, epoch: Epoch) -> PaxosError {
        match self.0.instances.read().get(service) {
        | Some(handle) => PaxosError::StaleEpoch {
            service: service.to_owned(),
            current: handle.epoch,
            requested: epoch,
        },
        | None => PaxosError::UnknownService(service.to_owned()),
        }
    }

    async fn submit(&self, handle: &Handle, request: Request) -> Result<Slot, PaxosError> {
        let (tx, rx) = oneshot::channel();
        if !handle.tx.send(In::Propose(request, tx)) {
            return Err(PaxosError::Cancelled)
        }
        match tokio::time::timeout(self.config().request_timeout, rx).await {
        | Ok(Ok(result)) => result,
        | Ok(Err(_)) => Err(PaxosError::Cancelled),
        | Err(_) => {
            let coordinator = Self::query(handle).await.map(|status| status.ballot.coordinator);
            Err(PaxosError::Timeout { coordinator })
        }
        }
    }

    async fn query(handle: &Handle) -> Option<Status> {
        let (tx, rx) = oneshot::channel();
        if !handle.tx.send(In::Status(tx)) {
            return None
        }
        rx.await.ok()
    }

    /// Snapshot of the current instance of `service`.
    pub async fn status(&self, service: &str) -> Option<Status> {
        let handle = self.current(service).ok()?;
        Self::query(&handle).await
    }

    /// Snapshot of a specific epoch, current or retired.
    pub async fn status_of(&self, service: &str, epoch: Epoch) -> Option<Status> {
        let handle = self.lookup(service, epoch)?;
        Self::query(&handle).await
    }

    /// Reloads every persisted instance. The newest epoch of each service
    /// resumes; older ones come back retired so they can still serve sync.
    /// Returns the number of instances recovered.
    pub fn recover(&self) -> Result<usize, PaxosError> {
        let store = &self.0.context.store;
        let keys = store.keys()?;
        let mut latest: Map<String, Epoch> = Map::default();
        for (service, epoch) in &keys {
            let entry = latest.entry(service.clone()).or_insert(*epoch);
            *entry = (*entry).max(*epoch);
        }

        let mut recovered = 0;
        for (service, epoch) in keys {
            let record = match store.load(&service, epoch)? {
            | Some(record) => record,
            | None => continue,
            };
            let current = latest.get(&service) == Some(&epoch);
            let instance = Instance::recover(self.0.context.clone(), record, current, Instant::now());
            let handle = self.spawn(instance);
            if current {
                self.0.instances.write().insert(service, handle);
            } else {
                self.0.retired.write().insert((service, epoch), handle);
            }
            recovered += 1;
        }
        info!("node {} recovered {} instance(s)", self.id(), recovered);
        Ok(recovered)
    }

    /// Routes inbound packets and pings group peers until `inbound` closes.
    pub async fn run(self, mut inbound: internal::Rx<Packet>) {
        let mut ping = tokio::time::interval(self.config().ping_interval());
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                packet = inbound.recv() => match packet {
                | Some(packet) => self.route_message(packet),
                | None => break,
                },
                _ = ping.tick() => self.ping(),
            }
        }
        info!("node {} stopped routing", self.id());
    }

    fn ping(&self) {
        let id = self.id();
        let mut peers = self.0.instances
            .read()
            .values()
            .flat_map(|handle| handle.group.iter().copied())
            .filter(|peer| *peer != id)
            .collect::<Vec<_>>();
        peers.sort_unstable();
        peers.dedup();
        for peer in peers {
            self.send(peer, Packet::new(id, "", 0, Body::Ping));
        }
    }

    /// Drops every instance handle without touching stable storage, so the
    /// instance tasks wind down as if the node had crashed.
    pub fn shutdown(&self) {
        self.0.instances.write().clear();
        self.0.retired.write().clear();
        self.0.tasks.lock().clear();
        info!("node {} shut down", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::LocalNetwork;
    use crate::state::{Checkpointable, Executable, Reconfigurable};
    use crate::storage::MemoryStore;

    /// Stateless application that cannot delete final states.
    struct Forgetful;

    impl Executable for Forgetful {
        fn execute(&self, _: &Request) -> bool {
            true
        }
    }

    impl Checkpointable for Forgetful {
        fn checkpoint(&self, _: &str) -> Option<Vec<u8>> {
            Some(Vec::new())
        }

        fn restore(&self, _: &str, _: &[u8]) -> bool {
            true
        }
    }

    impl Reconfigurable for Forgetful {
        fn get_final_state(&self, _: &str, _: Epoch) -> Option<Vec<u8>> {
            None
        }

        fn put_initial_state(&self, _: &str, _: Epoch, _: &[u8]) -> bool {
            true
        }

        fn delete_final_state(&self, _: &str, _: Epoch) -> bool {
            false
        }

        fn get_epoch(&self, _: &str) -> Option<Epoch> {
            None
        }
    }

    fn start(epoch: Epoch) -> Packet {
        Packet::new(9, "svc", epoch, Body::StartEpoch { group: vec![0], state: Vec::new() })
    }

    #[tokio::test]
    async fn dropped_epoch_is_acknowledged_and_never_restarted() {
        let network = LocalNetwork::new();
        let (transport, _inbound) = network.join(0);
        let (_driver, mut replies) = network.join(9);
        let manager = PaxosManager::new(Config::new(0), Arc::new(Forgetful), Arc::new(MemoryStore::new()), transport);

        manager.route_message(start(0));
        assert_eq!(manager.services(), vec![("svc".to_owned(), 0)]);
        assert_eq!(replies.recv().await.map(|packet| packet.kind()), Some(PacketType::AckStartEpoch));

        // Acknowledged even though the application kept its final state.
        manager.route_message(Packet::new(9, "svc", 0, Body::DropEpochFinalState));
        assert_eq!(replies.recv().await.map(|packet| packet.kind()), Some(PacketType::AckDropEpochFinalState));
        assert!(manager.services().is_empty());

        // A late duplicate of the start is acknowledged but ignored.
        manager.route_message(start(0));
        assert_eq!(replies.recv().await.map(|packet| packet.kind()), Some(PacketType::AckStartEpoch));
        assert!(manager.services().is_empty());
        assert_eq!(manager.get_or_create_instance("svc", 0, vec![0], None), Ok(false));

        manager.route_message(start(1));
        assert_eq!(manager.services(), vec![("svc".to_owned(), 1)]);
    }
}
