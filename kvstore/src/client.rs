use std::io::Write;

use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};

use gigapaxos::socket;
use gigapaxos::NodeId;
use kvstore::{ClientRequest, ClientResponse, Command};

enum Input {
    /// Connect to the server at the given port
    Connect { port: u16 },

    /// Disconnect from the current server
    Disconnect,

    /// Send a request for one service to the current server
    Send(ClientRequest),

    Help,
}

fn usage() {
    println!(
        "{}{}{}{}{}{}{}{}{}{}{}",
        "----------------------------------------------------------------------\n",
        "Possible commands:\n",
        "connect <PORT>             | c <PORT>   -- Connect to server at <PORT>\n",
        "disconnect                 | d          -- Disconnect from current server\n",
        "create <SVC> <ID>...                    -- Create <SVC> on the given servers\n",
        "reconfigure <SVC> <ID>...  | r          -- Move <SVC> to the given servers\n",
        "delete <SVC>                            -- Delete <SVC>\n",
        "put <SVC> <KEY> <VALUE>    | p          -- Write <VALUE> under <KEY>\n",
        "get <SVC> <KEY>            | g          -- Read <KEY>\n",
        "remove <SVC> <KEY>                      -- Remove <KEY>\n",
        "----------------------------------------------------------------------",
    );
}

fn group<'a, I: Iterator<Item = &'a str>>(words: I) -> Result<Vec<NodeId>, ()> {
    let group = words
        .map(|word| word.parse::<NodeId>().map_err(|_| ()))
        .collect::<Result<Vec<_>, _>>()?;
    if group.is_empty() {
        Err(())
    } else {
        Ok(group)
    }
}

impl std::str::FromStr for Input {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next();
        if let Some("help") | Some("h") = verb {
            return Ok(Input::Help)
        }
        if let Some("disconnect") | Some("d") = verb {
            return Ok(Input::Disconnect)
        }
        if let Some("connect") | Some("c") = verb {
            return words.next()
                .ok_or(())
                .and_then(|port| port.parse().map_err(|_| ()))
                .map(|port| Input::Connect { port })
        }
        let service = words.next().ok_or(())?.to_string();
        let command = match verb {
        | Some("create") => Command::Create { group: group(words)? },
        | Some("reconfigure") | Some("r") => Command::Reconfigure { group: group(words)? },
        | Some("delete") => Command::Delete,
        | Some("put") | Some("p") => {
            let key = words.next().ok_or(())?.to_string();
            let value = words.collect::<Vec<_>>().join(" ");
            Command::Put { key, value }
        }
        | Some("get") | Some("g") => Command::Get { key: words.next().ok_or(())?.to_string() },
        | Some("remove") => Command::Remove { key: words.next().ok_or(())?.to_string() },
        | _ => return Err(()),
        };
        Ok(Input::Send(ClientRequest { service, command }))
    }
}

type Connection = (socket::Rx<ClientResponse>, socket::Tx<ClientRequest>);

async fn connect(port: u16) -> Option<Connection> {
    match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
    | Ok(stream) => {
        println!("[RESPONSE]: connected to server at port {}", port);
        Some(socket::split(stream))
    }
    | Err(_) => {
        println!("[ERROR]: failed to connect to server at port {}", port);
        None
    }
    }
}

async fn run(port: Option<u16>) {
    let mut stdout = std::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut connection = match port {
    | Some(port) => connect(port).await,
    | None => None,
    };

    // Main interaction loop
    loop {
        print!("> ");
        stdout.flush().ok();

        let line = match lines.next_line().await {
        | Ok(Some(line)) => line,
        | _ => return,
        };

        // Attempt to parse command from user input
        let input = match line.parse::<Input>() {
        | Ok(input) => input,
        | Err(()) => {
            println!("[ERROR]: could not parse command");
            continue
        }
        };

        match input {
        | Input::Connect { port } => connection = connect(port).await,
        | Input::Disconnect => connection = None,
        | Input::Send(request) => {
            let (reader, writer) = match connection.as_mut() {
            | Some(connection) => connection,
            | None => {
                println!("[ERROR]: not connected to a server");
                continue
            }
            };
            if writer.send(request).await.is_err() {
                println!("[ERROR]: failed to send request");
                connection = None;
                continue
            }
            match reader.recv().await {
            | Some(ClientResponse::Error(error)) => println!("[ERROR]: {}", error),
            | Some(response) => println!("[RESPONSE]: {:?}", response),
            | None => {
                println!("[ERROR]: server closed the connection");
                connection = None;
            }
            }
        }
        | Input::Help => usage(),
        }
    }
}

#[derive(StructOpt)]
#[structopt(name = "kvstore-client")]
struct Opt {
    /// Port of the server to connect to on startup
    #[structopt(short = "p", long = "port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    usage();
    run(opt.port).await
}
