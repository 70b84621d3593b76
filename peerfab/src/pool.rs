//! A process-wide pool of RPC clients, keyed by endpoint.
//!
//! Connections are opened lazily on first use and then reused for the
//! lifetime of the process; nothing ever closes them. This trades setup
//! latency for memory proportional to the number of distinct peers
//! contacted, which is fine at the scale the engine targets.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{error::Result, rpc::RpcClient};

/// A shared, serialized RPC client as handed out by the pool.
pub type PooledClient = Arc<Mutex<RpcClient>>;

/// The pool of reusable peer connections.
///
/// There is exactly one pool per peer process; constructing one per
/// download (or worse, per chunk) defeats the point of pooling.
pub struct ConnectionPool {
    /// Guards the endpoint map. The lock is held across the connection
    /// attempt on a miss, which also serializes concurrent first requests
    /// for the same endpoint into a single connection.
    clients: Mutex<HashMap<String, PooledClient>>,
    /// Per-call deadline applied to every client the pool opens.
    timeout: Duration,
}

impl ConnectionPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Returns the client for the endpoint, connecting if this is the
    /// first request for it.
    ///
    /// Callers lock the returned client for the duration of one call;
    /// concurrent calls to the same endpoint take turns.
    pub async fn get(&self, endpoint: &str) -> Result<PooledClient> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(Arc::clone(client));
        }

        let client = RpcClient::connect(endpoint, self.timeout).await?;
        let client = Arc::new(Mutex::new(client));
        clients.insert(endpoint.to_string(), Arc::clone(&client));
        log::debug!(
            "Pooled new connection to {} ({} total)",
            endpoint,
            clients.len()
        );
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_get_reuses_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            // hold accepted sockets open so the clients stay connected
            let mut sockets = Vec::new();
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                sockets.push(socket);
            }
        });

        let pool = ConnectionPool::new(Duration::from_secs(5));
        let first = pool.get(&addr).await.expect("first get");
        let second = pool.get(&addr).await.expect("second get");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_get_unreachable_endpoint_fails() {
        let pool = ConnectionPool::new(Duration::from_millis(200));
        // a port from the reserved range nothing listens on
        assert!(pool.get("127.0.0.1:1").await.is_err());
    }
}
