use thiserror::Error;

/// The result type used by the whole crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire frame could not be encoded or decoded.
    #[error("wire format error: {0}")]
    Wire(#[from] bincode::Error),

    /// A frame header announced a length beyond what any valid message can
    /// have. Either the peer is broken or we are not talking to a peer.
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    /// An RPC did not complete within its configured deadline.
    #[error("RPC timed out")]
    Timeout,

    /// The remote side closed the connection mid-exchange.
    #[error("connection closed by remote")]
    ConnectionClosed,

    /// The remote side answered with a response variant the request cannot
    /// produce.
    #[error("unexpected RPC response")]
    UnexpectedResponse,

    /// The tracker already has a live peer under this name.
    #[error("name '{0}' is already in use")]
    NameInUse(String),

    /// Peer names must be non-empty.
    #[error("invalid peer name")]
    InvalidPeerName,

    /// The tracker does not know the peer, either because it never
    /// registered or because its heartbeats expired.
    #[error("peer '{0}' not found on tracker")]
    PeerNotFound(String),

    /// The tracker holds no terminal checksum for the file, so a download
    /// of it could never be verified.
    #[error("no checksum known for file '{0}'")]
    ChecksumNotFound(String),

    /// A chunk name refused by the path safety check: it contained a path
    /// separator, a parent directory component or was otherwise not a name
    /// our chunker could have produced.
    #[error("unsafe chunk name '{0}'")]
    UnsafeChunkName(String),

    /// The requested download parallelism is outside what the contribution
    /// gate allows for the number of chunks we currently seed.
    #[error("parallelism {requested} out of bounds, share more chunks to raise the cap (currently 1..={cap})")]
    ParallelismBound { requested: usize, cap: usize },

    /// One or more chunks failed to download; the transfer was aborted
    /// before assembly.
    #[error("{} chunk(s) failed to download", .failures.len())]
    Download { failures: Vec<ChunkFailure> },

    /// The reassembled file did not hash to the tracker's terminal
    /// checksum.
    #[error("assembled file '{file}' failed verification: expected {expected}, got {actual}")]
    AssemblyMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// A structured error string returned by the tracker.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// A tagged error string returned by a peer, e.g. for a chunk it no
    /// longer has on disk.
    #[error("peer error: {0}")]
    Peer(String),
}

/// A single chunk's failure within one download attempt.
///
/// Failures never retry within the download they occurred in; the caller
/// may reissue the whole download to retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFailure {
    /// The chunk that could not be fetched.
    pub chunk_name: String,
    /// What went wrong, e.g. "checksum mismatch" or "peer not found".
    pub reason: String,
}

impl std::fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.chunk_name, self.reason)
    }
}
