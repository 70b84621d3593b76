//! The client half of the RPC surface: a connection that performs one
//! request/response exchange at a time with a fixed per-call deadline.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;

use crate::{
    error::{Error, Result},
    wire::{ClientCodec, Request, Response},
};

/// A connected RPC client.
///
/// The client is deliberately not internally synchronized: a call borrows
/// it mutably, so concurrent users must serialize through a mutex (the
/// [connection pool](crate::pool) wraps every client that way).
pub struct RpcClient {
    framed: Framed<TcpStream, ClientCodec>,
    endpoint: String,
    timeout: Duration,
}

impl RpcClient {
    /// Connects to the given endpoint. Both the connection attempt and
    /// every later call are bounded by `timeout`.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        log::debug!("Connecting to {}", endpoint);
        let socket = time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(Self {
            framed: Framed::new(socket, ClientCodec::default()),
            endpoint: endpoint.to_string(),
            timeout,
        })
    }

    /// The endpoint this client is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one request and awaits its response, within the client's
    /// deadline.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        let timeout = self.timeout;
        let exchange = async {
            self.framed.send(request).await?;
            match self.framed.next().await {
                Some(response) => response,
                None => Err(Error::ConnectionClosed),
            }
        };
        match time::timeout(timeout, exchange).await {
            Ok(response) => response,
            Err(_) => {
                log::warn!("RPC to {} timed out", self.endpoint);
                Err(Error::Timeout)
            }
        }
    }
}
