//! The request/response RPC surface shared by the tracker and peer
//! services, and the codec that frames it.
//!
//! Every exchange is one [`Request`] answered by one [`Response`]. Frames
//! are a 4 byte big endian length prefix followed by a bincode payload.
//! Chunk payloads travel as a distinct binary value ([`Response::ChunkData`])
//! rather than a string, the same distinction the XML-RPC `<base64>` tag
//! draws in the systems this wire format descends from.

use std::{collections::HashMap, marker::PhantomData};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    ChunkInfo,
};

/// The sentinel returned for lookups of peers the tracker doesn't know.
/// Kept verbatim for wire compatibility with existing deployments.
pub const PEER_NOT_FOUND: &str = "Peer não encontrado.";

/// The sentinel returned when a file has no terminal checksum on record.
pub const CHECKSUM_NOT_FOUND: &str = "Checksum não encontrado.";

/// Structural prefix of tracker error strings.
pub const TRACKER_ERROR_PREFIX: &str = "Error: ";

/// Structural prefix of peer error strings, e.g. from `send_chunk`.
pub const PEER_ERROR_PREFIX: &str = "Erro: ";

/// Frames larger than this are refused outright. The largest legitimate
/// frame is a chunk payload plus its envelope; everything else is noise or
/// a length header we misread.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// The tracker's register error string for a name that is still live.
pub fn name_in_use_msg(name: &str) -> String {
    format!("{}name '{}' is already in use.", TRACKER_ERROR_PREFIX, name)
}

/// A tracker record: `peer` holds `chunk` of some file, with the file
/// implied by the index the advertisement is stored under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAdvert {
    /// The advertising peer's name.
    pub peer: String,
    /// The advertised chunk.
    pub chunk: ChunkInfo,
}

/// All requests a client can make, against either service.
///
/// The tracker serves the directory methods, a peer serves the transfer
/// methods; a request sent to the wrong service gets [`Response::Error`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Claim `name` and advertise `endpoint` as where this peer serves.
    Register { name: String, endpoint: String },
    /// All currently live peers.
    ListClients,
    /// Where does the named peer serve?
    GetPeerAddress { name: String },
    /// Liveness announcement.
    Heartbeat { name: String },
    /// Advertise chunks of a file, optionally with its terminal checksum.
    RegisterChunks {
        peer: String,
        file: String,
        chunks: Vec<ChunkInfo>,
        file_checksum: Option<String>,
    },
    /// All advertisements for a file.
    GetFileChunks { file: String },
    /// The file's terminal checksum.
    GetFileChecksum { file: String },
    /// The raw bytes of a chunk, by its on-disk name.
    SendChunk { chunk_name: String },
    /// The names of the files a peer shares.
    GetFiles,
    /// A chat line from another peer.
    ReceiveMessage { text: String, from: String },
}

/// The single return value of each request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Registration succeeded; carries a human readable confirmation.
    Registered(String),
    /// Peer name to endpoint, live peers only.
    Clients(HashMap<String, String>),
    PeerAddress(String),
    /// False means the tracker doesn't know us (e.g. swept or restarted).
    HeartbeatAck(bool),
    ChunksRegistered(bool),
    /// Empty if the file is unknown.
    FileChunks(Vec<ChunkAdvert>),
    FileChecksum(String),
    /// Chunk payload, tagged as binary on the wire.
    ChunkData(#[serde(with = "serde_bytes")] Vec<u8>),
    Files(Vec<String>),
    MessageAck(bool),
    /// A structural error string, e.g. [`PEER_NOT_FOUND`] or anything
    /// prefixed with [`TRACKER_ERROR_PREFIX`]/[`PEER_ERROR_PREFIX`].
    Error(String),
}

/// Length-prefix framing for one direction of an RPC connection.
///
/// The codec is generic over what it reads and what it writes so that the
/// same implementation serves both ends: [`ClientCodec`] writes requests
/// and reads responses, [`ServerCodec`] the reverse.
pub struct RpcCodec<In, Out> {
    _marker: PhantomData<fn() -> (In, Out)>,
}

/// The codec a connecting client speaks.
pub type ClientCodec = RpcCodec<Response, Request>;
/// The codec a serving task speaks.
pub type ServerCodec = RpcCodec<Request, Response>;

impl<In, Out> Default for RpcCodec<In, Out> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Decoder for RpcCodec<In, Out>
where
    In: serde::de::DeserializeOwned,
{
    type Item = In;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(header) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame_len));
        }

        if src.len() < 4 + frame_len {
            // keep room for the rest of the frame
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(frame_len);
        Ok(Some(bincode::deserialize(&frame)?))
    }
}

impl<In, Out> Encoder<Out> for RpcCodec<In, Out>
where
    Out: serde::Serialize,
{
    type Error = Error;

    fn encode(&mut self, msg: Out, dst: &mut BytesMut) -> Result<()> {
        let payload = bincode::serialize(&msg)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
