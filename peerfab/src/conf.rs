//! This module defines types used to configure the tracker and peer
//! services and their parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// The address the tracker listens on by convention.
pub const DEFAULT_TRACKER_ADDR: &str = "127.0.0.1:9000";

/// The port range out of which a peer picks its listen port at random.
pub const PEER_PORT_RANGE: std::ops::Range<u16> = 10_000..60_000;

/// Configuration for the tracker service.
#[derive(Clone, Debug)]
pub struct TrackerConf {
    /// The address the directory RPC service binds to.
    pub listen_addr: SocketAddr,

    /// A peer whose last heartbeat is older than this is treated as gone
    /// and removed from the directory, along with all its chunk
    /// advertisements. The background sweeper also runs at this period.
    pub heartbeat_timeout: Duration,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            // the conventional tracker endpoint; every peer defaults to it
            listen_addr: DEFAULT_TRACKER_ADDR.parse().unwrap(),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a peer process.
///
/// A peer serves chunks out of its share directory and downloads into it;
/// the directory *is* the local chunk store.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// The peer's unique name, its primary key on the tracker.
    pub name: String,

    /// The directory out of which files are shared and into which
    /// downloads are placed.
    pub share_dir: PathBuf,

    /// The tracker endpoint, as advertised to other peers.
    pub tracker_addr: String,

    /// The address to serve chunks on. When `None`, a loopback port is
    /// picked at random from [`PEER_PORT_RANGE`].
    pub listen_addr: Option<SocketAddr>,

    /// How often the heartbeat task announces liveness to the tracker.
    pub heartbeat_interval: Duration,

    /// After this many consecutive heartbeat failures the peer considers
    /// the tracker unreachable and shuts itself down.
    pub max_heartbeat_failures: u32,

    /// Deadline for small control RPCs (registration, lookups,
    /// heartbeats).
    pub rpc_timeout: Duration,

    /// Deadline for bulk transfer RPCs (chunk payloads).
    pub transfer_timeout: Duration,
}

impl PeerConf {
    /// Returns the peer configuration with the conventional defaults,
    /// except for the name and share directory, as it is not sensible to
    /// guess those for the user.
    pub fn new(name: impl Into<String>, share_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            share_dir: share_dir.into(),
            tracker_addr: DEFAULT_TRACKER_ADDR.to_string(),
            listen_addr: None,
            heartbeat_interval: Duration::from_secs(5),
            max_heartbeat_failures: 3,
            rpc_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}
