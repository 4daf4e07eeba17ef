use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap as Map;
use log::{error, info, warn};
use structopt::StructOpt;
use tokio::net::{TcpListener, TcpStream};

use gigapaxos::socket;
use gigapaxos::{Config, FileStore, NodeId, PaxosError, PaxosManager, Reconfigurator, TcpTransport};
use kvstore::{ClientRequest, ClientResponse, Command, KvStore, Operation};

#[derive(StructOpt)]
#[structopt(name = "kvstore-server")]
struct Opt {
    /// Unique server ID, an index into the peer addresses
    #[structopt(short = "i", long = "id")]
    id: NodeId,

    /// Peer addresses of every server, in ID order
    #[structopt(short = "a", long = "addresses", required = true)]
    addresses: Vec<SocketAddr>,

    /// Port to listen on for client requests
    #[structopt(short = "p", long = "port")]
    port: u16,

    /// Directory holding this server's instance records
    #[structopt(short = "d", long = "dir", parse(from_os_str))]
    dir: PathBuf,

    /// Failure detection timeout (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "2000")]
    timeout: u64,

    /// Checkpoint every this many slots
    #[structopt(short = "c", long = "checkpoint", default_value = "400")]
    checkpoint: u64,

    /// Logging verbosity
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

struct Server {
    manager: PaxosManager,
    reconfigurator: Reconfigurator,
    app: Arc<KvStore>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if let Err(error) = kvstore::init_logging(opt.verbose) {
        eprintln!("[ERROR]: could not install logger: {}", error);
    }
    if let Err(error) = run(opt).await {
        error!("{}", error);
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let addresses = opt.addresses
        .iter()
        .copied()
        .enumerate()
        .collect::<Map<NodeId, SocketAddr>>();
    let (transport, inbound) = TcpTransport::bind(opt.id, &addresses).await?;
    let store = Arc::new(FileStore::new(&opt.dir)?);
    let app = Arc::new(KvStore::default());
    let config = Config::new(opt.id)
        .with_failure_timeout(Duration::from_millis(opt.timeout))
        .with_checkpoint_interval(opt.checkpoint);

    let manager = PaxosManager::new(config, app.clone(), store.clone(), transport);
    manager.recover()?;
    let reconfigurator = Reconfigurator::new(manager.clone(), store)?;
    tokio::spawn(manager.clone().run(inbound));

    let server = Arc::new(Server {
        reconfigurator,
        manager,
        app,
    });

    let listener = TcpListener::bind(("127.0.0.1", opt.port)).await?;
    info!("server {} accepting clients on port {}", opt.id, opt.port);
    loop {
        match listener.accept().await {
        | Ok((stream, address)) => {
            info!("client connected from {}", address);
            tokio::spawn(serve(stream, server.clone()));
        }
        | Err(error) => warn!("failed to accept client: {}", error),
        }
    }
}

async fn serve(stream: TcpStream, server: Arc<Server>) {
    let (mut rx, mut tx) = socket::split::<ClientRequest, ClientResponse>(stream);
    while let Some(request) = rx.recv().await {
        let response = server.handle(request).await;
        if tx.send(response).await.is_err() {
            break
        }
    }
}

impl Server {
    async fn handle(&self, request: ClientRequest) -> ClientResponse {
        let ClientRequest { service, command } = request;
        let result = match command {
        | Command::Create { group } => self.reconfigurator
            .create(&service, group, KvStore::empty_state())
            .await
            .map(|_| ClientResponse::Done),
        | Command::Reconfigure { group } => self.reconfigurator
            .reconfigure(&service, group)
            .await
            .map(ClientResponse::Epoch),
        | Command::Delete => self.reconfigurator
            .delete(&service)
            .await
            .map(|_| ClientResponse::Done),
        | Command::Put { key, value } => self
            .replicate(&service, Operation::Put { key, value })
            .await
            .map(|_| ClientResponse::Done),
        | Command::Remove { key } => self
            .replicate(&service, Operation::Remove { key })
            .await
            .map(|_| ClientResponse::Done),
        | Command::Get { key } => self
            .replicate(&service, Operation::Read)
            .await
            .map(|_| ClientResponse::Value(self.app.get(&service, &key))),
        };
        result.unwrap_or_else(|error| ClientResponse::Error(error.to_string()))
    }

    async fn replicate(&self, service: &str, operation: Operation) -> Result<(), PaxosError> {
        self.manager.propose(service, operation.encode()).await.map(drop)
    }
}
