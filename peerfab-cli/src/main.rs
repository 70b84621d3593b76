//! The peerfab command line: run a tracker, or run a peer with a small
//! interactive shell. All the actual engine logic lives in the `peerfab`
//! library crate.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use peerfab::{
    conf::{PeerConf, TrackerConf, DEFAULT_TRACKER_ADDR},
    download::Downloader,
    error::{Error, Result},
    peer::{client::PeerClient, Peer},
    pool::ConnectionPool,
    tracker::{client::TrackerClient, Tracker},
    Shutdown,
};

#[derive(Parser)]
#[command(
    name = "peerfab",
    about = "A small BitTorrent-style file sharing fabric",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker: the directory every peer registers with.
    Tracker {
        /// Address to listen on.
        #[arg(long, default_value = DEFAULT_TRACKER_ADDR)]
        listen: std::net::SocketAddr,
        /// Seconds without a heartbeat after which a peer is dropped.
        #[arg(long, default_value_t = 30)]
        heartbeat_timeout: u64,
    },
    /// Run a peer: share the given directory and open a command shell.
    Peer {
        /// The peer's unique name on the tracker.
        #[arg(long)]
        name: String,
        /// Directory to share from and download into.
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// The tracker's endpoint.
        #[arg(long, default_value = DEFAULT_TRACKER_ADDR)]
        tracker: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let shutdown = Shutdown::new();

    // ctrl-c feeds the same cooperative shutdown the services use
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });
    }

    let outcome = match cli.command {
        Command::Tracker {
            listen,
            heartbeat_timeout,
        } => {
            let conf = TrackerConf {
                listen_addr: listen,
                heartbeat_timeout: Duration::from_secs(heartbeat_timeout),
            };
            run_tracker(conf, shutdown).await
        }
        Command::Peer { name, dir, tracker } => {
            run_peer(name, dir, tracker, shutdown).await
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_tracker(conf: TrackerConf, shutdown: Shutdown) -> Result<()> {
    Tracker::bind(conf, shutdown).await?.run().await
}

async fn run_peer(
    name: String,
    dir: PathBuf,
    tracker: String,
    shutdown: Shutdown,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut conf = PeerConf::new(name, dir);
    conf.tracker_addr = tracker;

    // names are first come first served; keep prompting until one sticks
    let peer = loop {
        match Peer::start(conf.clone(), shutdown.clone()).await {
            Ok(peer) => break peer,
            Err(Error::NameInUse(name)) => {
                println!("Name '{}' is taken, enter another:", name);
                match lines.next_line().await? {
                    Some(line) if !line.trim().is_empty() => {
                        conf.name = line.trim().to_string();
                    }
                    _ => return Err(Error::NameInUse(name)),
                }
            }
            Err(e) => return Err(e),
        }
    };

    let shared = peer.announce_shared().await?;
    println!(
        "Peer '{}' up on {}, sharing {} file(s).",
        peer.name(),
        peer.endpoint(),
        shared
    );

    let local_name = peer.name().to_string();
    let tracker = peer.tracker();
    let pool = Arc::new(ConnectionPool::new(conf.transfer_timeout));
    let downloader = Downloader::new(
        local_name.clone(),
        conf.share_dir.clone(),
        tracker.clone(),
        Arc::clone(&pool),
    );

    let serving = tokio::spawn(peer.run());
    shell(&mut lines, &local_name, &tracker, &pool, &downloader, &shutdown)
        .await?;

    shutdown.trigger();
    let _ = serving.await;
    Ok(())
}

const SHELL_HELP: &str = "commands: 'list' peers and their files, \
'get <file> [n]' to download, 'msg <peer> <text>' to chat, 'exit' to quit";

async fn shell(
    lines: &mut Lines<BufReader<Stdin>>,
    local_name: &str,
    tracker: &TrackerClient,
    pool: &Arc<ConnectionPool>,
    downloader: &Downloader,
    shutdown: &Shutdown,
) -> Result<()> {
    println!("{}", SHELL_HELP);
    let mut shutdown_signal = shutdown.clone();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let mut words = line.split_whitespace();
                match words.next() {
                    Some("list") => list(local_name, tracker, pool).await,
                    Some("get") => {
                        let file = match words.next() {
                            Some(file) => file,
                            None => {
                                println!("usage: get <file> [n]");
                                continue;
                            }
                        };
                        let n_parallel = words
                            .next()
                            .and_then(|n| n.parse().ok())
                            .unwrap_or(1);
                        match downloader.download(file, n_parallel).await {
                            Ok(()) => println!("Downloaded '{}'.", file),
                            Err(e) => println!("Download failed: {}", e),
                        }
                    }
                    Some("msg") => {
                        let peer = match words.next() {
                            Some(peer) => peer,
                            None => {
                                println!("usage: msg <peer> <text>");
                                continue;
                            }
                        };
                        let text: Vec<&str> = words.collect();
                        message(local_name, tracker, pool, peer, &text.join(" "))
                            .await;
                    }
                    Some("exit") => break,
                    Some(_) | None => println!("{}", SHELL_HELP),
                }
            }
            _ = shutdown_signal.triggered() => break,
        }
    }
    Ok(())
}

/// Lists every live peer and the files it shares.
async fn list(
    local_name: &str,
    tracker: &TrackerClient,
    pool: &Arc<ConnectionPool>,
) {
    let clients = match tracker.list_clients().await {
        Ok(clients) => clients,
        Err(e) => {
            println!("Could not list peers: {}", e);
            return;
        }
    };
    if clients.is_empty() {
        println!("No peers connected.");
        return;
    }
    for (name, endpoint) in clients {
        if name == local_name {
            println!("{} (you)", name);
            continue;
        }
        let files = match pool.get(&endpoint).await {
            Ok(client) => PeerClient::new(client).get_files().await,
            Err(e) => Err(e),
        };
        match files {
            Ok(files) => println!("{}: {:?}", name, files),
            Err(e) => println!("{}: files unavailable ({})", name, e),
        }
    }
}

/// Delivers one chat line to a peer by name.
async fn message(
    local_name: &str,
    tracker: &TrackerClient,
    pool: &Arc<ConnectionPool>,
    peer: &str,
    text: &str,
) {
    let sent = async {
        let endpoint = tracker.peer_address(peer).await?;
        let client = pool.get(&endpoint).await?;
        PeerClient::new(client).send_message(text, local_name).await
    }
    .await;
    match sent {
        Ok(_) => println!("Sent to {}.", peer),
        Err(e) => println!("Could not message {}: {}", peer, e),
    }
}
