use std::collections::HashSet as Set;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gigapaxos::shared::LocalNetwork;
use gigapaxos::{Config, MemoryStore, NodeId, PaxosError, PaxosManager, Reconfigurator};
use kvstore::{KvStore, Operation, Table};

pub struct Node {
    pub manager: PaxosManager,
    pub app: Arc<KvStore>,
    pub store: Arc<MemoryStore>,
    pub reconfigurator: Arc<Reconfigurator>,
    pub crashed: bool,
}

/// In-process cluster of kvstore replicas.
pub struct Cluster {
    network: LocalNetwork,
    cut: Arc<Mutex<Set<(NodeId, NodeId)>>>,
    nodes: Vec<Node>,
}

fn config(id: NodeId) -> Config {
    Config::new(id)
        .with_tick_interval(Duration::from_millis(10))
        .with_failure_timeout(Duration::from_millis(500))
        .with_prepare_timeout(Duration::from_millis(200))
        .with_accept_timeout(Duration::from_millis(200))
        .with_max_timeout(Duration::from_secs(2))
        .with_checkpoint_interval(16)
        .with_min_resync_delay(Duration::from_millis(100))
        .with_idle_sync_interval(Duration::from_secs(1))
        .with_request_timeout(Duration::from_secs(3))
        .with_reconfigure_period(Duration::from_millis(300))
        .with_reconfigure_timeout(Duration::from_secs(20))
}

impl Cluster {
    pub fn start(count: usize) -> Result<Self, String> {
        let network = LocalNetwork::new();
        let cut: Arc<Mutex<Set<(NodeId, NodeId)>>> = Arc::default();
        let links = cut.clone();
        network.set_filter(move |from, to, _| links.lock().contains(&(from, to)));
        let nodes = (0..count)
            .map(|id| Cluster::boot(&network, id, Arc::new(MemoryStore::new())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Cluster { network, cut, nodes })
    }

    fn boot(network: &LocalNetwork, id: NodeId, store: Arc<MemoryStore>) -> Result<Node, String> {
        let (transport, inbound) = network.join(id);
        let app = Arc::new(KvStore::default());
        let manager = PaxosManager::new(config(id), app.clone(), store.clone(), transport);
        let reconfigurator = Reconfigurator::new(manager.clone(), store.clone()).map_err(|error| error.to_string())?;
        tokio::spawn(manager.clone().run(inbound));
        Ok(Node {
            reconfigurator: Arc::new(reconfigurator),
            manager,
            app,
            store,
            crashed: false,
        })
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, String> {
        match self.nodes.get(id) {
        | Some(node) if !node.crashed => Ok(node),
        | Some(_) => Err(format!("node {} is crashed", id)),
        | None => Err(format!("no node {}", id)),
        }
    }

    pub fn crash(&mut self, id: NodeId) -> Result<(), String> {
        self.node(id)?.manager.shutdown();
        self.network.crash(id);
        self.nodes[id].crashed = true;
        Ok(())
    }

    pub fn restart(&mut self, id: NodeId) -> Result<usize, String> {
        let store = match self.nodes.get(id) {
        | Some(node) if node.crashed => node.store.clone(),
        | _ => return Err(format!("node {} is not crashed", id)),
        };
        self.nodes[id] = Cluster::boot(&self.network, id, store)?;
        self.nodes[id].manager.recover().map_err(|error| error.to_string())
    }

    pub fn cut(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut.lock();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    pub fn heal(&self) {
        self.cut.lock().clear();
    }

    /// Replicates `operation` through node `id`, retrying timeouts.
    pub async fn replicate(&self, id: NodeId, service: &str, operation: Operation) -> Result<(), String> {
        let node = self.node(id)?;
        let mut last = None;
        for _ in 0..5 {
            match node.manager.propose(service, operation.encode()).await {
            | Ok(_) => return Ok(()),
            | Err(error @ PaxosError::Timeout { .. })
            | Err(error @ PaxosError::Redirect { .. }) => last = Some(error),
            | Err(error) => return Err(error.to_string()),
            }
        }
        Err(last.map(|error| error.to_string()).unwrap_or_default())
    }

    /// Tables of `service` on every live node currently hosting it.
    pub fn tables(&self, service: &str) -> Vec<(NodeId, Option<Table>)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.crashed)
            .filter(|(_, node)| node.manager.services().iter().any(|(name, _)| name == service))
            .map(|(id, node)| (id, node.app.table(service)))
            .collect()
    }
}
