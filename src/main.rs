//! CONCLAVE - Peer Node
//! Starts one node of the cluster and offers an administration console.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;

use conclave::cluster::Node;
use conclave::config::NodeConfig;

/// Command-line arguments for a Conclave node.
#[derive(Parser, Debug)]
#[command(name = "conclave", version, about = "Self-organizing key-value peer node")]
struct Cli {
    /// Node identifier to use on first start (a UUID is generated otherwise).
    #[arg(long)]
    id: Option<String>,

    /// Directory holding namespace storage.
    #[arg(long, default_value = "./data/namespaces")]
    data_store_path: PathBuf,

    /// Directory holding the node's system store.
    #[arg(long, default_value = "./data/system")]
    system_store_path: PathBuf,

    /// Address the point-to-point listener binds and advertises.
    #[arg(long, default_value = "127.0.0.1")]
    system_address: String,

    /// Port of the point-to-point listener (0 picks one).
    #[arg(long, default_value_t = 21000)]
    system_port: u16,

    /// Local socket for broadcast datagrams.
    #[arg(long, default_value = "0.0.0.0:21012")]
    broadcast_bind: SocketAddr,

    /// Broadcast destination; repeat for a static peer list.
    #[arg(long = "broadcast-target")]
    broadcast_targets: Vec<SocketAddr>,

    /// Election timeout in seconds.
    #[arg(long, default_value_t = 10)]
    election_timeout: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig {
            data_store_path: self.data_store_path,
            system_store_path: self.system_store_path,
            ..NodeConfig::default()
        }
        .with_system_address(self.system_address, self.system_port)
        .with_election_timeout(Duration::from_secs(self.election_timeout));
        if !self.broadcast_targets.is_empty() {
            config = config.with_broadcast(self.broadcast_bind, self.broadcast_targets);
        } else {
            config.broadcast_bind = self.broadcast_bind;
        }
        if let Some(id) = self.id {
            config = config.with_identifier(id);
        }
        config
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let node = match Node::start(cli.into_config()) {
        Ok(node) => node,
        Err(err) => {
            eprintln!("[ERROR] Failed to start node: {}", err);
            std::process::exit(1);
        }
    };

    if let Some(faults) = node.faults() {
        thread::spawn(move || {
            if let Ok(fault) = faults.recv() {
                log::error!("unrecoverable fault in {}", fault);
                eprintln!("[FATAL] {}", fault);
                std::process::exit(2);
            }
        });
    }

    println!();
    println!("  CONCLAVE node {}", node.id());
    println!(
        "  listening on {}:{}",
        node.identity().address,
        node.identity().port
    );
    println!();
    println!("  Commands:");
    println!("    use <namespace>    - Switch namespace (empty for default)");
    println!("    set <key> <value>  - Store a key-value pair through the leader");
    println!("    get <key>          - Read a value from local storage");
    println!("    del <key>          - Delete a key through the leader");
    println!("    flush              - Flush every namespace memtable");
    println!("    compact            - Compact every namespace");
    println!("    leader             - Show the elected leader");
    println!("    peers              - List connected peers");
    println!("    info               - Show node and engine statistics");
    println!("    exit               - Shutdown node");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut namespace = String::new();

    loop {
        print!("conclave[{}]> ", namespace);
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("[ERROR] reading input: {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "use" => {
                let next = parts.get(1).copied().unwrap_or("");
                match conclave::types::Namespace::parse(next) {
                    Ok(_) => namespace = next.to_string(),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let value = parts[2..].join(" ");
                match node.set(&namespace, parts[1], &value) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match node.get(&namespace, parts[1]) {
                    Ok(Some(value)) => println!("  \"{}\"", value),
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match node.delete(&namespace, parts[1]) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "flush" => match node.storage().flush_all() {
                Ok(n) => println!("  flushed {} namespace(s)", n),
                Err(e) => println!("  ERROR: {}", e),
            },
            "compact" => match node.storage().compact_all() {
                Ok(n) => println!("  {} merge(s)", n),
                Err(e) => println!("  ERROR: {}", e),
            },
            "leader" => {
                let status = node.status();
                match status.leader {
                    Some(leader) => println!("  {} (epoch {}, {})", leader, status.epoch, status.state),
                    None => println!("  (none, {})", status.state),
                }
            }
            "peers" => {
                let peers = node.peers();
                if peers.is_empty() {
                    println!("  (no peers)");
                }
                for peer in peers {
                    println!("  {} at {}:{}", peer.id, peer.address, peer.port);
                }
            }
            "info" | "stats" => {
                let status = node.status();
                println!("  Node:      {}", node.id());
                println!("  State:     {} (epoch {})", status.state, status.epoch);
                println!("  Peers:     {}", node.peers().len());
                print!("{}", node.storage().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down CONCLAVE...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = node.shutdown() {
        eprintln!("[ERROR] Shutdown failed: {}", e);
        std::process::exit(1);
    }
}
