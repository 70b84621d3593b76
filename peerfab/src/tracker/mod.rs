//! The tracker service: a request/response RPC surface over the
//! in-memory [`Directory`], plus the background liveness sweeper.
//!
//! The tracker is a coordination directory only; chunk payload never
//! passes through it. All directory operations, reads included, serialize
//! through one mutex.

pub mod client;
mod directory;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::{
    conf::TrackerConf,
    error::{Error, Result},
    shutdown::Shutdown,
    wire::{self, Request, Response, ServerCodec},
};
use directory::Directory;

pub struct Tracker {
    conf: TrackerConf,
    listener: TcpListener,
    directory: Arc<Mutex<Directory>>,
    shutdown: Shutdown,
}

impl Tracker {
    /// Binds the tracker's listen socket and sets up an empty directory.
    ///
    /// Binding is separate from [`run`](Self::run) so that a caller using
    /// an OS assigned port can learn the actual address first.
    pub async fn bind(conf: TrackerConf, shutdown: Shutdown) -> Result<Self> {
        let listener = TcpListener::bind(conf.listen_addr).await?;
        log::info!("Tracker listening on {}", listener.local_addr()?);
        let directory =
            Arc::new(Mutex::new(Directory::new(conf.heartbeat_timeout)));
        Ok(Self {
            conf,
            listener,
            directory,
            shutdown,
        })
    }

    /// The address the tracker actually listens on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves the directory until shutdown is triggered.
    ///
    /// Each accepted connection gets its own dispatch task; the liveness
    /// sweeper runs alongside with a period equal to the heartbeat
    /// timeout.
    pub async fn run(self) -> Result<()> {
        let Self {
            conf,
            listener,
            directory,
            shutdown,
        } = self;

        let sweeper_directory = Arc::clone(&directory);
        let mut sweeper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conf.heartbeat_timeout);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweeper_directory.lock().unwrap().sweep();
                    }
                    _ = sweeper_shutdown.triggered() => break,
                }
            }
        });

        let mut shutdown_signal = shutdown;
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    let (socket, addr) = conn?;
                    log::debug!("Tracker connection from {}", addr);
                    let directory = Arc::clone(&directory);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(directory, socket).await {
                            log::warn!("Tracker connection {} error: {}", addr, e);
                        }
                    });
                }
                _ = shutdown_signal.triggered() => {
                    log::info!("Shutting down tracker");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Serves one client connection until it hangs up.
async fn handle_connection(
    directory: Arc<Mutex<Directory>>,
    socket: TcpStream,
) -> Result<()> {
    let mut framed = Framed::new(socket, ServerCodec::default());
    while let Some(request) = framed.next().await {
        let response = dispatch(&directory, request?);
        framed.send(response).await?;
    }
    Ok(())
}

/// Maps one request to its response. Every arm is a single critical
/// section against the directory.
fn dispatch(directory: &Mutex<Directory>, request: Request) -> Response {
    let mut directory = directory.lock().unwrap();
    match request {
        Request::Register { name, endpoint } => {
            match directory.register(&name, &endpoint) {
                Ok(msg) => Response::Registered(msg),
                Err(Error::NameInUse(name)) => {
                    Response::Error(wire::name_in_use_msg(&name))
                }
                Err(e) => Response::Error(format!(
                    "{}{}",
                    wire::TRACKER_ERROR_PREFIX,
                    e
                )),
            }
        }
        Request::ListClients => Response::Clients(directory.list_clients()),
        Request::GetPeerAddress { name } => {
            match directory.peer_address(&name) {
                Some(endpoint) => Response::PeerAddress(endpoint),
                None => Response::Error(wire::PEER_NOT_FOUND.to_string()),
            }
        }
        Request::Heartbeat { name } => {
            Response::HeartbeatAck(directory.heartbeat(&name))
        }
        Request::RegisterChunks {
            peer,
            file,
            chunks,
            file_checksum,
        } => match directory.register_chunks(&peer, &file, chunks, file_checksum)
        {
            Ok(()) => Response::ChunksRegistered(true),
            Err(_) => Response::Error(wire::PEER_NOT_FOUND.to_string()),
        },
        Request::GetFileChunks { file } => {
            Response::FileChunks(directory.file_chunks(&file))
        }
        Request::GetFileChecksum { file } => {
            match directory.file_checksum(&file) {
                Some(checksum) => Response::FileChecksum(checksum),
                None => Response::Error(wire::CHECKSUM_NOT_FOUND.to_string()),
            }
        }
        // the transfer surface lives on peers
        Request::SendChunk { .. }
        | Request::GetFiles
        | Request::ReceiveMessage { .. } => Response::Error(format!(
            "{}tracker does not serve transfer methods.",
            wire::TRACKER_ERROR_PREFIX
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::Error, tracker::client::TrackerClient};

    async fn start_tracker(heartbeat_timeout: Duration) -> (SocketAddr, Shutdown) {
        let shutdown = Shutdown::new();
        let conf = TrackerConf {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_timeout,
        };
        let tracker = Tracker::bind(conf, shutdown.clone())
            .await
            .expect("bind tracker");
        let addr = tracker.local_addr().expect("addr");
        tokio::spawn(tracker.run());
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_liveness_expiry_over_rpc() {
        let (addr, shutdown) =
            start_tracker(Duration::from_millis(100)).await;
        let client =
            TrackerClient::connect(&addr.to_string(), Duration::from_secs(5))
                .await
                .expect("connect");

        client
            .register("x", "127.0.0.1:10001")
            .await
            .expect("register");
        assert!(client.list_clients().await.expect("list").contains_key("x"));

        // miss every heartbeat until well past the timeout; the sweeper
        // runs at the timeout period so two periods is plenty
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(client.list_clients().await.expect("list").is_empty());
        assert!(matches!(
            client.peer_address("x").await,
            Err(Error::PeerNotFound(_))
        ));
        // a heartbeat after the sweep does not resurrect the peer
        assert!(!client.heartbeat("x").await.expect("heartbeat"));

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_concurrent_register_same_name() {
        let (addr, shutdown) = start_tracker(Duration::from_secs(30)).await;
        let first =
            TrackerClient::connect(&addr.to_string(), Duration::from_secs(5))
                .await
                .expect("connect");
        let second =
            TrackerClient::connect(&addr.to_string(), Duration::from_secs(5))
                .await
                .expect("connect");

        let (a, b) = tokio::join!(
            first.register("alice", "127.0.0.1:10001"),
            second.register("alice", "127.0.0.1:10002"),
        );
        // exactly one of the two racing registrations wins
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            if a.is_err() { a } else { b },
            Err(Error::NameInUse(_))
        ));

        shutdown.trigger();
    }
}
