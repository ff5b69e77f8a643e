//! peerdoc: interactive todo-list peer
//!
//! Obtains an actor id from the identity service, listens for peer links
//! over TCP, connects to the primary, and then edits the shared todo list
//! from commands typed on stdin. The list is reprinted whenever it changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use peerdoc::convergent::ActorId;
use peerdoc::identity::{HttpIdentityClient, Identity, IdentityService, PeerAddress, StaticIdentity};
use peerdoc::network::{TcpTransport, Transport};
use peerdoc::todo::{self, Todo, TodoFilter, TODO_DOC};
use peerdoc::{Replica, ReplicaConfig, ReplicaHandle};

#[derive(Parser)]
#[command(name = "peerdoc")]
#[command(about = "Peer-to-peer replicated todo list")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity service base URL (overrides config file)
    #[arg(long)]
    identity_url: Option<String>,

    /// Address to listen on for peer links (overrides config file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run without the identity service under this actor id
    #[arg(long)]
    id: Option<String>,

    /// Known peer as ID=ADDR; may be repeated
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, SocketAddr)>,

    /// Connect to this peer at startup (defaults to the primary)
    #[arg(long)]
    join: Option<String>,
}

fn parse_peer(s: &str) -> Result<(String, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got '{}'", s))?;
    let addr = addr.parse().map_err(|e| format!("bad address '{}': {}", addr, e))?;
    Ok((id.to_string(), addr))
}

const HELP: &str = "\
commands:
  add <title>          add a todo
  toggle <n>           toggle todo n
  edit <n> <title>     retitle todo n
  rm <n>               delete todo n
  all                  toggle every todo
  clear                delete completed todos
  ls [all|active|completed]
  peers                show connections
  connect <id>         connect to a peer
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ReplicaConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ReplicaConfig::default(),
    };
    if let Some(url) = cli.identity_url.clone() {
        config.identity_url = url;
    }
    if let Some(addr) = cli.listen {
        config.listen_addr = addr;
    }

    let service: Arc<dyn IdentityService> = match &cli.id {
        Some(id) => Arc::new(StaticIdentity::new(
            Identity {
                id: id.clone(),
                primary: None,
            },
            Vec::new(),
        )),
        None => Arc::new(HttpIdentityClient::new(config.identity_url.clone())),
    };
    let identity = service
        .identify()
        .await
        .context("contacting identity service")?;
    log::info!("we are {} (primary: {:?})", identity.id, identity.primary);

    let (transport, events) =
        TcpTransport::bind(identity.id.clone(), config.listen_addr, config.max_frame_bytes).await?;
    println!("actor {} listening on {}", identity.id, transport.local_addr());

    let announce = PeerAddress {
        id: identity.id.clone(),
        addr: transport.local_addr().to_string(),
    };
    if let Err(e) = service.announce(&announce).await {
        log::warn!("could not announce our address: {}", e);
    }
    refresh_directory(service.as_ref(), &transport).await;
    for (id, addr) in &cli.peers {
        transport.add_address(id.clone(), *addr);
    }

    let link: Arc<dyn Transport> = transport.clone();
    let replica = Replica::new(link, &config);
    let (handle, task) = ReplicaHandle::spawn(replica, events);

    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
    handle
        .subscribe(move |id| {
            let _ = changed_tx.send(id.clone());
        })
        .await?;
    let printer = handle.clone();
    tokio::spawn(async move {
        while let Some(id) = changed_rx.recv().await {
            if id == TODO_DOC {
                if let Ok(doc) = printer.snapshot(TODO_DOC).await {
                    print_list(&todo::todos(doc.state()));
                }
            }
        }
    });

    match identity.primary.clone() {
        None => {
            let seed = service.seed_todos().await.unwrap_or_else(|e| {
                log::warn!("no seed todos: {}", e);
                Vec::new()
            });
            if !seed.is_empty() {
                handle.propose(TODO_DOC, move |tx| todo::seed(tx, &seed)).await?;
            }
        }
        Some(primary) => handle.set_primary(primary)?,
    }
    if let Some(peer) = cli.join.clone().or(identity.primary) {
        connect(&handle, service.as_ref(), &transport, peer).await;
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(line.trim(), &handle, service.as_ref(), &transport).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {}", e),
        }
    }

    handle.shutdown();
    let _ = task.await;
    Ok(())
}

async fn refresh_directory(service: &dyn IdentityService, transport: &TcpTransport) {
    match service.peers().await {
        Ok(peers) => {
            for peer in peers {
                match peer.addr.parse() {
                    Ok(addr) => transport.add_address(peer.id, addr),
                    Err(e) => log::warn!("bad address {} for {}: {}", peer.addr, peer.id, e),
                }
            }
        }
        Err(e) => log::warn!("could not fetch peer directory: {}", e),
    }
}

async fn connect(handle: &ReplicaHandle, service: &dyn IdentityService, transport: &TcpTransport, peer: ActorId) {
    if transport.address_of(&peer).is_none() {
        refresh_directory(service, transport).await;
    }
    match handle.connect(&peer).await {
        Ok(outcome) => log::info!("connect {}: {:?}", peer, outcome),
        Err(e) => log::warn!("could not connect to {}: {}", peer, e),
    }
}

/// Todo at a 1-based position of the full list
async fn nth(handle: &ReplicaHandle, arg: &str) -> anyhow::Result<Todo> {
    let n: usize = arg.parse().with_context(|| format!("'{}' is not a number", arg))?;
    let doc = handle.snapshot(TODO_DOC).await?;
    n.checked_sub(1)
        .and_then(|i| todo::todos(doc.state()).into_iter().nth(i))
        .ok_or_else(|| anyhow!("no todo #{}", n))
}

/// Run one command; `Ok(false)` means quit.
async fn run_command(
    line: &str,
    handle: &ReplicaHandle,
    service: &dyn IdentityService,
    transport: &TcpTransport,
) -> anyhow::Result<bool> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "" => {}
        "add" if !rest.is_empty() => {
            let title = rest.to_string();
            handle
                .propose(TODO_DOC, move |tx| {
                    todo::add_todo(tx, &title);
                })
                .await?;
        }
        "toggle" => {
            let target = nth(handle, rest).await?;
            handle
                .propose(TODO_DOC, move |tx| {
                    todo::toggle(tx, &target.id);
                })
                .await?;
        }
        "edit" => {
            let (n, title) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: edit <n> <title>"))?;
            let target = nth(handle, n).await?;
            let title = title.trim().to_string();
            handle
                .propose(TODO_DOC, move |tx| {
                    todo::edit(tx, &target.id, &title);
                })
                .await?;
        }
        "rm" => {
            let target = nth(handle, rest).await?;
            handle
                .propose(TODO_DOC, move |tx| {
                    todo::destroy(tx, &target.id);
                })
                .await?;
        }
        "all" => {
            let doc = handle.snapshot(TODO_DOC).await?;
            let checked = todo::active_count(doc.state()) > 0;
            handle
                .propose(TODO_DOC, move |tx| todo::toggle_all(tx, checked))
                .await?;
        }
        "clear" => {
            handle
                .propose(TODO_DOC, |tx| {
                    todo::clear_completed(tx);
                })
                .await?;
        }
        "ls" => {
            let filter: TodoFilter = if rest.is_empty() {
                TodoFilter::All
            } else {
                rest.parse().map_err(|e: String| anyhow!(e))?
            };
            let doc = handle.snapshot(TODO_DOC).await?;
            print_list(&todo::filtered(doc.state(), filter));
        }
        "peers" => {
            let status = handle.status().await?;
            if let Some(primary) = &status.primary {
                println!("primary: {}", primary);
            }
            for peer in status.peers {
                println!(
                    "{}  {:?}{}  outstanding: {:?}",
                    peer.peer,
                    peer.state,
                    if peer.stuck { " (stuck)" } else { "" },
                    peer.outstanding
                );
            }
            for doc in status.documents {
                if doc.pending > 0 {
                    println!("{}: {} change(s) waiting on {:?}", doc.id, doc.pending, doc.missing);
                }
            }
        }
        "connect" if !rest.is_empty() => {
            connect(handle, service, transport, rest.to_string()).await;
        }
        "quit" | "exit" => return Ok(false),
        _ => println!("{}", HELP),
    }
    Ok(true)
}

fn print_list(todos: &[Todo]) {
    println!("----");
    for (i, todo) in todos.iter().enumerate() {
        println!("{:>3}. {}", i + 1, todo);
    }
    let left = todos.iter().filter(|t| !t.completed).count();
    println!("{} item{} left", left, if left == 1 { "" } else { "s" });
}
