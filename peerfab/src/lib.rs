//! peerfab is a small BitTorrent-style file sharing engine: a central
//! tracker indexes which peers hold which chunks of which files, and peers
//! transfer the chunks directly between themselves. Files are split into
//! fixed size chunks, every chunk is content hashed, and a receiver
//! verifies each chunk before it advertises itself as a seeder for it. The
//! tracker never carries file payload.
//!
//! The crate is the engine only: the [`tracker`] service and its in-memory
//! directory, the [`peer`] service that serves chunk bytes, the
//! [`chunker`]/[`hasher`] integrity pipeline and the parallel [`download`]
//! engine. Interactive shells live in the `peerfab-cli` binary.

#[macro_use]
extern crate serde_derive;

pub mod chunker;
pub mod conf;
pub mod download;
pub mod error;
pub mod hasher;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod shutdown;
pub mod tracker;
pub mod wire;

pub use shutdown::Shutdown;

/// The type of a chunk's index within its file.
///
/// Chunk indices are dense: a file of `n` chunks is covered by the indices
/// `0..n`, in file order.
pub type ChunkIndex = usize;

/// The size every chunk is cut to, except for possibly the last chunk of
/// a file. All peers must agree on this value or their checksums won't
/// line up.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// A chunk is a fixed size slice of a file; transfers between peers happen
/// at this granularity. This describes one chunk without its payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// The zero-based position of the chunk in the original file.
    pub index: ChunkIndex,
    /// The chunk's stable identifier on the wire and on disk, always
    /// [`chunk_name`]`(file, index)`.
    pub name: String,
    /// The lowercase hex SHA-256 of the chunk's bytes.
    pub checksum: String,
}

/// Returns the on-wire and on-disk name of a file's chunk.
///
/// The name is a pure function of the file name and chunk index so that
/// every peer names every chunk the same way, no matter where the bytes
/// came from.
pub fn chunk_name(file: &str, index: ChunkIndex) -> String {
    format!("{}.chunk{}", file, index)
}

/// Returns the number of chunks a file of the given length is split into.
///
/// A zero length file has no chunks at all; anything else rounds up, as
/// the last chunk may be shorter than [`CHUNK_SIZE`].
pub fn chunk_count(file_len: u64) -> usize {
    ((file_len + CHUNK_SIZE - 1) / CHUNK_SIZE) as usize
}

/// Returns the length of the chunk at the given index in a file of the
/// given length.
///
/// # Panics
///
/// Panics if the index is out of bounds for the file length.
pub fn chunk_len(file_len: u64, index: ChunkIndex) -> u64 {
    let offset = index as u64 * CHUNK_SIZE;
    assert!(file_len > offset);
    std::cmp::min(file_len - offset, CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary file length that is an exact multiple of the chunk size.
    const CHUNK_SIZE_MULTIPLE_FILE_LEN: u64 = 3 * CHUNK_SIZE;

    // An arbitrary file length that is _not_ a multiple of the chunk size
    // and the amount with which it overlaps the nearest exact multiple.
    const OVERLAP: u64 = 1234;
    const UNEVEN_FILE_LEN: u64 = 3 * CHUNK_SIZE + OVERLAP;

    #[test]
    fn test_chunk_name() {
        assert_eq!(chunk_name("notes.txt", 0), "notes.txt.chunk0");
        assert_eq!(chunk_name("notes.txt", 12), "notes.txt.chunk12");
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(CHUNK_SIZE_MULTIPLE_FILE_LEN), 3);
        assert_eq!(chunk_count(UNEVEN_FILE_LEN), 4);
    }

    #[test]
    fn test_chunk_len() {
        assert_eq!(chunk_len(CHUNK_SIZE_MULTIPLE_FILE_LEN, 0), CHUNK_SIZE);
        assert_eq!(chunk_len(CHUNK_SIZE_MULTIPLE_FILE_LEN, 2), CHUNK_SIZE);

        assert_eq!(chunk_len(UNEVEN_FILE_LEN, 2), CHUNK_SIZE);
        assert_eq!(chunk_len(UNEVEN_FILE_LEN, 3), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_chunk_len_invalid_index_panic() {
        chunk_len(CHUNK_SIZE_MULTIPLE_FILE_LEN, 3);
    }
}
