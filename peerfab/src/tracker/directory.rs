//! The tracker's in-memory state: who is alive, where they serve, and
//! which chunks of which files they advertise.
//!
//! The directory is one value owned by the tracker service; every
//! operation takes it by mutable reference under the service's single
//! mutex, so each method body is one atomic step against the state. There
//! is no persistence: a restarted tracker starts empty and peers
//! re-register on their next heartbeat failure cycle.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    wire::ChunkAdvert,
    ChunkInfo,
};

pub(crate) struct Directory {
    /// A peer whose heartbeat is older than this is gone.
    heartbeat_timeout: Duration,
    /// Peer name to the endpoint it serves chunks on.
    ///
    /// Invariant: a name is in `clients` exactly when it is in
    /// `heartbeats`.
    clients: HashMap<String, String>,
    /// Peer name to its most recent heartbeat.
    heartbeats: HashMap<String, Instant>,
    /// File name to every advertisement the tracker holds for it. Files
    /// with no advertisements left have no entry at all.
    file_chunks: HashMap<String, Vec<ChunkAdvert>>,
    /// File name to terminal (whole file) checksum. Retained even when the
    /// last seeder expires, as another seeder may return.
    file_checksums: HashMap<String, String>,
}

impl Directory {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            clients: HashMap::new(),
            heartbeats: HashMap::new(),
            file_chunks: HashMap::new(),
            file_checksums: HashMap::new(),
        }
    }

    /// Registers a peer under a unique name.
    ///
    /// A name is only taken while its holder is live: if the present
    /// holder's heartbeat has expired, the stale entry is swept and the
    /// name is handed over.
    pub fn register(&mut self, name: &str, endpoint: &str) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidPeerName);
        }

        if let Some(last) = self.heartbeats.get(name) {
            if last.elapsed() > self.heartbeat_timeout {
                log::info!("Name '{}' freed by expired holder", name);
                self.remove_peer(name);
            } else {
                log::info!("Rejecting registration, '{}' is taken", name);
                return Err(Error::NameInUse(name.to_string()));
            }
        }

        self.clients.insert(name.to_string(), endpoint.to_string());
        self.heartbeats.insert(name.to_string(), Instant::now());
        log::info!("Registered peer '{}' at {}", name, endpoint);
        Ok(format!("Peer '{}' registered.", name))
    }

    /// Refreshes a peer's liveness. Returns false for peers the directory
    /// doesn't know; a heartbeat never revives a swept peer.
    pub fn heartbeat(&mut self, name: &str) -> bool {
        match self.heartbeats.get_mut(name) {
            Some(last) => {
                // `Instant::now` under the directory lock is monotonic, so
                // a delayed heartbeat can only move the timestamp forward
                *last = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes every peer whose heartbeat has expired, cascading to its
    /// chunk advertisements.
    pub fn sweep(&mut self) {
        let expired: Vec<String> = self
            .heartbeats
            .iter()
            .filter(|(_, last)| last.elapsed() > self.heartbeat_timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            log::info!("Sweeping expired peer '{}'", name);
            self.remove_peer(name);
        }
        debug_assert_eq!(self.clients.len(), self.heartbeats.len());
    }

    /// Returns all live peers and their endpoints, sweeping first so the
    /// listing never contains the dead.
    pub fn list_clients(&mut self) -> HashMap<String, String> {
        self.sweep();
        self.clients.clone()
    }

    /// The endpoint a peer serves on, if the directory knows it.
    pub fn peer_address(&self, name: &str) -> Option<String> {
        self.clients.get(name).cloned()
    }

    /// Records chunk advertisements for a file, and its terminal checksum
    /// when one is supplied (the last non-null write wins).
    ///
    /// Advertisements are only accepted from registered peers; a rejection
    /// here tells the peer it has been swept. Re-advertising the same
    /// chunk replaces the previous tuple, so the per-file list holds one
    /// entry per `(peer, chunk name)`.
    pub fn register_chunks(
        &mut self,
        peer: &str,
        file: &str,
        chunks: Vec<ChunkInfo>,
        file_checksum: Option<String>,
    ) -> Result<()> {
        if !self.clients.contains_key(peer) {
            log::warn!(
                "Refusing chunk advertisements from unknown peer '{}'",
                peer
            );
            return Err(Error::PeerNotFound(peer.to_string()));
        }

        if !chunks.is_empty() {
            let adverts = self.file_chunks.entry(file.to_string()).or_default();
            for chunk in chunks {
                adverts.retain(|advert| {
                    !(advert.peer == peer && advert.chunk.name == chunk.name)
                });
                adverts.push(ChunkAdvert {
                    peer: peer.to_string(),
                    chunk,
                });
            }
        }

        if let Some(checksum) = file_checksum {
            self.file_checksums.insert(file.to_string(), checksum);
        }
        Ok(())
    }

    /// Every advertisement for a file; empty if the file is unknown.
    pub fn file_chunks(&self, file: &str) -> Vec<ChunkAdvert> {
        self.file_chunks.get(file).cloned().unwrap_or_default()
    }

    /// The file's terminal checksum, if any seeder ever supplied one.
    pub fn file_checksum(&self, file: &str) -> Option<String> {
        self.file_checksums.get(file).cloned()
    }

    /// Removes a peer and everything it advertised. Files left with no
    /// advertisers disappear from the chunk index; their terminal
    /// checksums stay.
    fn remove_peer(&mut self, name: &str) {
        self.clients.remove(name);
        self.heartbeats.remove(name);
        self.file_chunks.retain(|_, adverts| {
            adverts.retain(|advert| advert.peer != name);
            !adverts.is_empty()
        });
    }
}
