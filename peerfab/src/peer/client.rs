//! A typed client for the transfer surface other peers serve.

use crate::{
    error::{Error, Result},
    pool::PooledClient,
    wire::{Request, Response},
};

/// A handle on one remote peer's transfer surface.
///
/// Thin by design: it borrows a pooled connection per call, so
/// constructing one is free and the download engine's workers build them
/// on the fly.
pub struct PeerClient {
    client: PooledClient,
}

impl PeerClient {
    /// Wraps a pooled connection to the remote peer.
    pub fn new(client: PooledClient) -> Self {
        Self { client }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.client.lock().await.call(request).await
    }

    /// Fetches a chunk's raw bytes by its name.
    ///
    /// The bytes are exactly what the remote read off its disk; verifying
    /// them against the advertised checksum is the caller's job.
    pub async fn send_chunk(&self, chunk_name: &str) -> Result<Vec<u8>> {
        let request = Request::SendChunk {
            chunk_name: chunk_name.to_string(),
        };
        match self.call(request).await? {
            Response::ChunkData(bytes) => Ok(bytes),
            Response::Error(msg) => Err(Error::Peer(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// The names of the files the remote peer shares.
    pub async fn get_files(&self) -> Result<Vec<String>> {
        match self.call(Request::GetFiles).await? {
            Response::Files(files) => Ok(files),
            Response::Error(msg) => Err(Error::Peer(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Delivers a chat line to the remote peer.
    pub async fn send_message(&self, text: &str, from: &str) -> Result<bool> {
        let request = Request::ReceiveMessage {
            text: text.to_string(),
            from: from.to_string(),
        };
        match self.call(request).await? {
            Response::MessageAck(ack) => Ok(ack),
            Response::Error(msg) => Err(Error::Peer(msg)),
            _ => Err(Error::UnexpectedResponse),
        }
    }
}
