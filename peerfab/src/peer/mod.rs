//! The peer service: serving chunk bytes and file listings to other
//! peers, plus the peer's own lifecycle against the tracker
//! (registration, startup announcements, heartbeats).

pub mod client;
mod heartbeat;

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::{
    chunker,
    conf::{PeerConf, PEER_PORT_RANGE},
    error::Result,
    hasher,
    shutdown::Shutdown,
    tracker::client::TrackerClient,
    wire::{self, Request, Response, ServerCodec},
    ChunkInfo,
};

/// A running peer: registered with the tracker and ready to serve chunks
/// out of its share directory.
pub struct Peer {
    conf: PeerConf,
    listener: TcpListener,
    endpoint: String,
    tracker: TrackerClient,
    shutdown: Shutdown,
}

impl Peer {
    /// Binds a serving socket, connects to the tracker and claims the
    /// configured name.
    ///
    /// Fails with [`crate::error::Error::NameInUse`] if another live peer
    /// holds the name; callers typically retry with a different one.
    pub async fn start(conf: PeerConf, shutdown: Shutdown) -> Result<Peer> {
        let listener = bind_listener(&conf).await?;
        let endpoint = listener.local_addr()?.to_string();

        let tracker =
            TrackerClient::connect(&conf.tracker_addr, conf.rpc_timeout)
                .await?;
        let msg = tracker.register(&conf.name, &endpoint).await?;
        log::info!("{} Serving on {}", msg, endpoint);

        Ok(Self {
            conf,
            listener,
            endpoint,
            tracker,
            shutdown,
        })
    }

    /// The endpoint this peer serves on, as advertised to the tracker.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    /// A handle on the peer's tracker connection.
    pub fn tracker(&self) -> TrackerClient {
        self.tracker.clone()
    }

    /// Splits every shareable file in the share directory and advertises
    /// the chunks, making this peer a seeder for all of them.
    pub async fn announce_shared(&self) -> Result<usize> {
        announce_shared(&self.tracker, &self.conf.name, &self.conf.share_dir)
            .await
    }

    /// Serves inbound requests and heartbeats the tracker until shutdown
    /// is triggered.
    pub async fn run(self) -> Result<()> {
        let Self {
            conf,
            listener,
            endpoint,
            tracker,
            shutdown,
        } = self;

        tokio::spawn(heartbeat::run(
            tracker,
            conf.clone(),
            endpoint,
            shutdown.clone(),
        ));

        let share_dir = conf.share_dir;
        let mut shutdown_signal = shutdown;
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    let (socket, addr) = conn?;
                    log::debug!("Peer connection from {}", addr);
                    let share_dir = share_dir.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(share_dir, socket).await {
                            log::warn!("Peer connection {} error: {}", addr, e);
                        }
                    });
                }
                _ = shutdown_signal.triggered() => {
                    log::info!("Shutting down peer '{}'", conf.name);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Splits every shareable file in the directory and advertises its chunks
/// and terminal checksum. Returns how many files are now shared.
///
/// Also used by the heartbeat task to restore our advertisements after
/// the tracker swept us or restarted empty.
pub async fn announce_shared(
    tracker: &TrackerClient,
    name: &str,
    share_dir: &Path,
) -> Result<usize> {
    let files = shareable_files(share_dir)?;
    let mut shared = 0;
    for file in files {
        let dir = share_dir.to_path_buf();
        let split_file = file.clone();
        // splitting hashes every chunk and the whole file; keep that off
        // the reactor
        let (chunks, checksum) = tokio::task::spawn_blocking(
            move || -> Result<(Vec<ChunkInfo>, String)> {
                let chunks = chunker::split(&dir, &split_file)?;
                let checksum = hasher::digest_file(dir.join(&split_file))?;
                Ok((chunks, checksum))
            },
        )
        .await
        .expect("share hashing task panicked")?;

        tracker
            .register_chunks(name, &file, &chunks, Some(checksum.as_str()))
            .await?;
        log::info!("Sharing '{}' ({} chunk(s))", file, chunks.len());
        shared += 1;
    }
    Ok(shared)
}

/// The names of the files this peer shares: `.txt` files that are not
/// chunk files.
pub fn shareable_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".txt") && !name.contains(".chunk") {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn bind_listener(conf: &PeerConf) -> Result<TcpListener> {
    if let Some(addr) = conf.listen_addr {
        return Ok(TcpListener::bind(addr).await?);
    }
    // the conventional setup: a loopback port picked at random, with a
    // few retries in case we land on a taken one
    let mut last_err = None;
    for _ in 0..16 {
        let port = rand::thread_rng().gen_range(PEER_PORT_RANGE);
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("no bind attempted").into())
}

/// Serves one remote peer's connection until it hangs up.
async fn handle_connection(
    share_dir: PathBuf,
    socket: TcpStream,
) -> Result<()> {
    let mut framed = Framed::new(socket, ServerCodec::default());
    while let Some(request) = framed.next().await {
        let response = dispatch(&share_dir, request?).await;
        framed.send(response).await?;
    }
    Ok(())
}

async fn dispatch(share_dir: &Path, request: Request) -> Response {
    match request {
        Request::SendChunk { chunk_name } => {
            send_chunk(share_dir, &chunk_name).await
        }
        Request::GetFiles => match shareable_files(share_dir) {
            Ok(files) => Response::Files(files),
            Err(e) => Response::Error(format!(
                "{}{}",
                wire::PEER_ERROR_PREFIX,
                e
            )),
        },
        Request::ReceiveMessage { text, from } => {
            // the interactive shell renders these; the engine just logs
            log::info!("Message from {}: {}", from, text);
            Response::MessageAck(true)
        }
        // the directory surface lives on the tracker
        _ => Response::Error(format!(
            "{}peer does not serve directory methods.",
            wire::PEER_ERROR_PREFIX
        )),
    }
}

/// Reads a chunk file verbatim and returns its bytes as a binary value,
/// or a tagged error string if it is missing.
///
/// Chunk names come straight off the wire, so they are path checked
/// before touching the filesystem.
async fn send_chunk(share_dir: &Path, chunk_name: &str) -> Response {
    let path = match chunker::checked_chunk_path(share_dir, chunk_name) {
        Ok(path) => path,
        Err(e) => {
            log::warn!("Refusing chunk request: {}", e);
            return Response::Error(format!(
                "{}{}",
                wire::PEER_ERROR_PREFIX,
                e
            ));
        }
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            log::debug!(
                "Serving chunk '{}' ({} bytes)",
                chunk_name,
                bytes.len()
            );
            Response::ChunkData(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Response::Error(format!(
                "{}chunk '{}' not found.",
                wire::PEER_ERROR_PREFIX,
                chunk_name
            ))
        }
        Err(e) => Response::Error(format!("{}{}", wire::PEER_ERROR_PREFIX, e)),
    }
}
