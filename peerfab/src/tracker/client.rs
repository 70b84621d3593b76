//! A typed client for the tracker's directory surface.
//!
//! The wire sentinels (e.g. [`wire::PEER_NOT_FOUND`]) are turned into
//! typed errors at this boundary, so nothing above it matches on strings.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    error::{Error, Result},
    pool::PooledClient,
    rpc::RpcClient,
    wire::{self, ChunkAdvert, Request, Response},
    ChunkInfo,
};

/// A shareable handle on the tracker.
///
/// Clones share one underlying connection and take turns on it, which is
/// all the download engine's workers need for their short directory
/// calls.
#[derive(Clone)]
pub struct TrackerClient {
    client: PooledClient,
}

impl TrackerClient {
    /// Wraps an already shared raw client, e.g. one handed out by the
    /// connection pool.
    pub fn new(client: PooledClient) -> Self {
        Self { client }
    }

    /// Opens a dedicated connection to the tracker.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = RpcClient::connect(endpoint, timeout).await?;
        Ok(Self::new(Arc::new(Mutex::new(client))))
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.client.lock().await.call(request).await
    }

    /// Claims `name` on the tracker and advertises `endpoint` for it.
    pub async fn register(&self, name: &str, endpoint: &str) -> Result<String> {
        let request = Request::Register {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        };
        match self.call(request).await? {
            Response::Registered(msg) => Ok(msg),
            Response::Error(msg) if msg.contains("already in use") => {
                Err(Error::NameInUse(name.to_string()))
            }
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// All currently live peers, name to endpoint.
    pub async fn list_clients(&self) -> Result<HashMap<String, String>> {
        match self.call(Request::ListClients).await? {
            Response::Clients(clients) => Ok(clients),
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// The endpoint the named peer serves chunks on.
    pub async fn peer_address(&self, name: &str) -> Result<String> {
        let request = Request::GetPeerAddress {
            name: name.to_string(),
        };
        match self.call(request).await? {
            Response::PeerAddress(endpoint) => Ok(endpoint),
            Response::Error(msg) if msg == wire::PEER_NOT_FOUND => {
                Err(Error::PeerNotFound(name.to_string()))
            }
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Announces liveness. A false ack means the tracker doesn't know us
    /// anymore (swept, or restarted empty).
    pub async fn heartbeat(&self, name: &str) -> Result<bool> {
        let request = Request::Heartbeat {
            name: name.to_string(),
        };
        match self.call(request).await? {
            Response::HeartbeatAck(ack) => Ok(ack),
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Advertises chunks of a file, optionally with the file's terminal
    /// checksum.
    pub async fn register_chunks(
        &self,
        peer: &str,
        file: &str,
        chunks: &[ChunkInfo],
        file_checksum: Option<&str>,
    ) -> Result<()> {
        let request = Request::RegisterChunks {
            peer: peer.to_string(),
            file: file.to_string(),
            chunks: chunks.to_vec(),
            file_checksum: file_checksum.map(str::to_string),
        };
        match self.call(request).await? {
            Response::ChunksRegistered(_) => Ok(()),
            Response::Error(msg) if msg == wire::PEER_NOT_FOUND => {
                Err(Error::PeerNotFound(peer.to_string()))
            }
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Every advertisement the tracker holds for a file; empty if the
    /// file is unknown.
    pub async fn file_chunks(&self, file: &str) -> Result<Vec<ChunkAdvert>> {
        let request = Request::GetFileChunks {
            file: file.to_string(),
        };
        match self.call(request).await? {
            Response::FileChunks(adverts) => Ok(adverts),
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// The file's terminal checksum; errors if no seeder ever supplied
    /// one, as a download without it could never be verified.
    pub async fn file_checksum(&self, file: &str) -> Result<String> {
        let request = Request::GetFileChecksum {
            file: file.to_string(),
        };
        match self.call(request).await? {
            Response::FileChecksum(checksum) => Ok(checksum),
            Response::Error(msg) if msg == wire::CHECKSUM_NOT_FOUND => {
                Err(Error::ChecksumNotFound(file.to_string()))
            }
            Response::Error(msg) => Err(Error::Tracker(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }
}
