use std::path::PathBuf;
use std::time::Duration;

use log::{error, info};
use structopt::StructOpt;

mod cluster;
mod command;

use crate::cluster::Cluster;
use crate::command::{Command, Execution};
use kvstore::Operation;

#[derive(StructOpt)]
#[structopt(name = "harness")]
struct Opt {
    /// Scenario file
    #[structopt(short = "f", long = "file", parse(from_os_str))]
    file: PathBuf,

    /// Logging verbosity
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

/// How long a `Check` waits for replicas to converge.
const CONVERGENCE: Duration = Duration::from_secs(10);

async fn execute(cluster: &mut Option<Cluster>, command: Command) -> Result<(), String> {
    match command {
    | Command::Start { count } => {
        *cluster = Some(Cluster::start(count)?);
        Ok(())
    }
    | command => match cluster.as_mut() {
        | Some(cluster) => apply(cluster, command).await,
        | None => Err("no cluster started".to_owned()),
    },
    }
}

async fn apply(cluster: &mut Cluster, command: Command) -> Result<(), String> {
    match command {
    | Command::Start { .. } => Err("cluster already started".to_owned()),
    | Command::Create { via, service, group } => cluster
        .node(via)?
        .reconfigurator
        .create(&service, group, kvstore::KvStore::empty_state())
        .await
        .map_err(|error| error.to_string()),
    | Command::Put { id, service, key, value } => {
        cluster.replicate(id, &service, Operation::Put { key, value }).await
    }
    | Command::Get { id, service, key, expect } => {
        cluster.replicate(id, &service, Operation::Read).await?;
        let value = cluster.node(id)?.app.get(&service, &key);
        println!("{} on node {}: {} = {:?}", service, id, key, value);
        match expect {
        | Some(expected) if value.as_ref() != Some(&expected) => {
            Err(format!("expected {:?}, found {:?}", expected, value))
        }
        | _ => Ok(()),
        }
    }
    | Command::Crash { id } => cluster.crash(id),
    | Command::Restart { id } => cluster.restart(id).map(|count| {
        println!("node {} recovered {} instance(s)", id, count);
    }),
    | Command::Cut { a, b } => {
        cluster.cut(a, b);
        Ok(())
    }
    | Command::Heal => {
        cluster.heal();
        Ok(())
    }
    | Command::Reconfigure { via, service, group } => cluster
        .node(via)?
        .reconfigurator
        .reconfigure(&service, group)
        .await
        .map(|epoch| println!("{} now at epoch {}", service, epoch))
        .map_err(|error| error.to_string()),
    | Command::Delete { via, service } => cluster
        .node(via)?
        .reconfigurator
        .delete(&service)
        .await
        .map_err(|error| error.to_string()),
    | Command::Sleep { ms } => {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }
    | Command::Check { service } => {
        let deadline = tokio::time::Instant::now() + CONVERGENCE;
        loop {
            let tables = cluster.tables(&service);
            let agree = tables.windows(2).all(|pair| pair[0].1 == pair[1].1);
            if agree {
                println!("{} agrees on {} node(s): {:?}", service, tables.len(), tables.first().map(|(_, table)| table));
                return Ok(())
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("{} diverged: {:?}", service, tables))
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if let Err(error) = kvstore::init_logging(opt.verbose) {
        eprintln!("[INTERNAL ERROR]: could not install logger: {}", error);
    }

    let execution: Execution = match std::fs::File::open(&opt.file)
        .map_err(|error| error.to_string())
        .and_then(|file| serde_json::from_reader(file).map_err(|error| error.to_string()))
    {
    | Ok(execution) => execution,
    | Err(error) => {
        eprintln!("[INTERNAL ERROR]: could not load {}: {}", opt.file.display(), error);
        std::process::exit(2);
    }
    };

    let mut cluster = None;
    let mut failures = 0;
    for command in execution.0 {
        info!("executing {:?}", command);
        println!("Executing command {:?}", command);
        if let Err(failure) = execute(&mut cluster, command).await {
            error!("{}", failure);
            println!("[FAILED]: {}", failure);
            failures += 1;
        }
    }
    if failures > 0 {
        println!("{} command(s) failed", failures);
        std::process::exit(1);
    }
}
