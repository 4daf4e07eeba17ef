#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap as Map;
use parking_lot::Mutex;

use gigapaxos::{
    Checkpointable, Config, Epoch, Executable, MemoryStore, NodeId, PaxosError, PaxosManager,
    Reconfigurable, Reconfigurator, Request, RequestId, Slot,
};
use gigapaxos::shared::LocalNetwork;

/// Appends every payload to a per-service list; the list is the state.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Map<String, Vec<Vec<u8>>>>,
    finals: Mutex<Map<(String, Epoch), Vec<u8>>>,
    epochs: Mutex<Map<String, Epoch>>,
}

impl Journal {
    pub fn entries(&self, service: &str) -> Vec<Vec<u8>> {
        self.entries.lock().get(service).cloned().unwrap_or_default()
    }

    pub fn has_final_state(&self, service: &str, epoch: Epoch) -> bool {
        self.finals.lock().contains_key(&(service.to_owned(), epoch))
    }
}

impl Executable for Journal {
    fn execute(&self, request: &Request) -> bool {
        if request.is_stop() {
            let state = self.checkpoint(&request.service).unwrap_or_default();
            self.finals.lock().insert((request.service.clone(), request.epoch), state);
        } else {
            self.entries.lock().entry(request.service.clone()).or_default().push(request.payload.clone());
        }
        self.epochs.lock().insert(request.service.clone(), request.epoch);
        true
    }
}

impl Checkpointable for Journal {
    fn checkpoint(&self, service: &str) -> Option<Vec<u8>> {
        bincode::serialize(&self.entries(service)).ok()
    }

    fn restore(&self, service: &str, state: &[u8]) -> bool {
        match bincode::deserialize::<Vec<Vec<u8>>>(state) {
        | Ok(entries) => {
            self.entries.lock().insert(service.to_owned(), entries);
            true
        }
        | Err(_) => false,
        }
    }
}

impl Reconfigurable for Journal {
    fn get_final_state(&self, service: &str, epoch: Epoch) -> Option<Vec<u8>> {
        self.finals.lock().get(&(service.to_owned(), epoch)).cloned()
    }

    fn put_initial_state(&self, service: &str, epoch: Epoch, state: &[u8]) -> bool {
        self.epochs.lock().insert(service.to_owned(), epoch);
        self.restore(service, state)
    }

    fn delete_final_state(&self, service: &str, epoch: Epoch) -> bool {
        self.finals.lock().remove(&(service.to_owned(), epoch)).is_some()
    }

    fn get_epoch(&self, service: &str) -> Option<Epoch> {
        self.epochs.lock().get(service).copied()
    }
}

pub fn empty_state() -> Vec<u8> {
    bincode::serialize(&Vec::<Vec<u8>>::new()).unwrap()
}

pub fn config(id: NodeId) -> Config {
    Config::new(id)
        .with_tick_interval(Duration::from_millis(10))
        .with_failure_timeout(Duration::from_millis(300))
        .with_prepare_timeout(Duration::from_millis(150))
        .with_accept_timeout(Duration::from_millis(150))
        .with_max_timeout(Duration::from_secs(1))
        .with_checkpoint_interval(8)
        .with_min_resync_delay(Duration::from_millis(100))
        .with_idle_sync_interval(Duration::from_millis(500))
        .with_request_timeout(Duration::from_secs(2))
        .with_reconfigure_period(Duration::from_millis(200))
}

pub struct Node {
    pub manager: PaxosManager,
    pub app: Arc<Journal>,
    pub store: Arc<MemoryStore>,
}

pub struct Cluster {
    pub network: LocalNetwork,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Starts `count` nodes on a fresh local network. Call inside a runtime.
    pub fn start(count: usize) -> Self {
        let network = LocalNetwork::new();
        let nodes = (0..count)
            .map(|id| Cluster::boot(&network, id, Arc::new(MemoryStore::new())))
            .collect();
        Cluster { network, nodes }
    }

    fn boot(network: &LocalNetwork, id: NodeId, store: Arc<MemoryStore>) -> Node {
        let (transport, inbound) = network.join(id);
        let app = Arc::new(Journal::default());
        let manager = PaxosManager::new(config(id), app.clone(), store.clone(), transport);
        tokio::spawn(manager.clone().run(inbound));
        Node { manager, app, store }
    }

    pub fn manager(&self, id: NodeId) -> &PaxosManager {
        &self.nodes[id].manager
    }

    pub fn app(&self, id: NodeId) -> &Journal {
        &self.nodes[id].app
    }

    /// A reconfigurator driven from `id`, keeping its records in `id`'s store.
    pub fn reconfigurator(&self, id: NodeId) -> Reconfigurator {
        Reconfigurator::new(self.manager(id).clone(), self.nodes[id].store.clone()).unwrap()
    }

    /// Creates epoch 0 of `service` directly on every member.
    pub fn create(&self, service: &str, group: &[NodeId]) {
        for id in group {
            self.manager(*id)
                .get_or_create_instance(service, 0, group.to_vec(), None)
                .unwrap();
        }
    }

    pub fn crash(&self, id: NodeId) {
        self.network.crash(id);
        self.manager(id).shutdown();
    }

    /// Brings `id` back with its old store and a blank application.
    pub fn restart(&mut self, id: NodeId) -> usize {
        let store = self.nodes[id].store.clone();
        self.nodes[id] = Cluster::boot(&self.network, id, store);
        self.manager(id).recover().unwrap()
    }
}

/// Retries a request with a fixed ID until some attempt executes.
pub async fn propose(manager: &PaxosManager, service: &str, epoch: Epoch, id: RequestId, payload: &[u8]) -> Slot {
    let request = Request::new(service, epoch, id, payload.to_vec());
    for _ in 0..20 {
        match manager.propose_request(request.clone()).await {
        | Ok(slot) => return slot,
        | Err(PaxosError::Timeout { .. })
        | Err(PaxosError::Redirect { .. })
        | Err(PaxosError::UnknownService(_)) => tokio::time::sleep(Duration::from_millis(100)).await,
        | Err(error) => panic!("request {} failed: {}", id, error),
        }
    }
    panic!("request {} never executed", id)
}

/// Polls `condition` until it holds or `within` passes.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where F: FnMut() -> bool
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Like `eventually`, for conditions that need to await.
pub async fn eventually_async<F, Fut>(within: Duration, mut condition: F) -> bool
where F: FnMut() -> Fut,
      Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
