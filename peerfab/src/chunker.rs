//! Splitting files into chunks and putting them back together.
//!
//! The working directory is the chunk store: the presence of
//! `<file>.chunk<i>` on disk means the peer holds that chunk. Splitting is
//! reproducible byte for byte across peers, which is what makes checksums
//! comparable at all.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use crate::{
    chunk_name,
    error::{Error, Result},
    hasher, ChunkInfo, CHUNK_SIZE,
};

/// Returns the name of the transient reassembly target for a file.
pub fn assembled_name(file: &str) -> String {
    format!("{}.assembled", file)
}

/// Validates a chunk name that arrived from the network and resolves it to
/// a path inside the chunk store.
///
/// Chunk names are plain file names produced by [`chunk_name`]; anything
/// with a path separator or a parent directory component is refused before
/// it gets near the filesystem.
pub fn checked_chunk_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let is_safe = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.');
    if !is_safe {
        return Err(Error::UnsafeChunkName(name.to_string()));
    }
    Ok(dir.join(name))
}

/// Splits `dir/<file>` into [`CHUNK_SIZE`] sized chunk files next to it
/// and returns their descriptors, in file order.
///
/// The final chunk may be shorter but never empty; a zero length file
/// yields no chunks at all. Re-running on the same file is idempotent, the
/// same bytes are written over the same chunk files.
pub fn split(dir: &Path, file: &str) -> Result<Vec<ChunkInfo>> {
    let mut src = File::open(dir.join(file))?;
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];

    for index in 0.. {
        let len = read_up_to(&mut src, &mut buf)?;
        if len == 0 {
            break;
        }
        let bytes = &buf[..len];
        let name = chunk_name(file, index);
        fs::write(dir.join(&name), bytes)?;
        chunks.push(ChunkInfo {
            index,
            name,
            checksum: hasher::digest(bytes),
        });
    }

    log::debug!("Split '{}' into {} chunk(s)", file, chunks.len());
    Ok(chunks)
}

/// Concatenates `dir/<file>.chunk0`, `dir/<file>.chunk1`, ... in order
/// into `dir/<file>.assembled`, stopping at the first missing index, and
/// returns the path of the assembled file.
///
/// Assembly is by chunk index, so the order in which chunks arrived on
/// disk cannot affect the result.
pub fn assemble(dir: &Path, file: &str) -> Result<PathBuf> {
    let out_path = dir.join(assembled_name(file));
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&out_path)?;

    for index in 0.. {
        let chunk_path = dir.join(chunk_name(file, index));
        let mut chunk = match File::open(&chunk_path) {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        };
        io::copy(&mut chunk, &mut out)?;
    }

    out.flush()?;
    Ok(out_path)
}

/// Counts the chunk files currently held in the store, across all files.
///
/// This is the peer's contribution: the download engine's tit-for-tat gate
/// caps parallelism by it.
pub fn local_chunk_count(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.contains(".chunk") {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Reads until the buffer is full or the file ends. A plain `read` may
/// return short before EOF, which would desynchronize chunk boundaries
/// between peers.
fn read_up_to(src: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read_count = src.read(&mut buf[filled..])?;
        if read_count == 0 {
            break;
        }
        filled += read_count;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store_with_file(len: usize) -> (tempfile::TempDir, Vec<u8>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        fs::write(dir.path().join("data.txt"), &payload).expect("write");
        (dir, payload)
    }

    #[test]
    fn test_split_assemble_round_trip() {
        // 2.5 MiB: two full chunks and a half chunk
        let (dir, payload) = store_with_file(5 * CHUNK_SIZE as usize / 2);

        let chunks = split(dir.path(), "data.txt").expect("split");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].name, "data.txt.chunk0");
        assert_eq!(chunks[2].index, 2);
        // indices are dense and in file order
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }

        let assembled = assemble(dir.path(), "data.txt").expect("assemble");
        assert_eq!(fs::read(assembled).expect("read"), payload);
    }

    #[test]
    fn test_split_is_deterministic() {
        let (dir, _) = store_with_file(CHUNK_SIZE as usize + 17);
        let first = split(dir.path(), "data.txt").expect("split");
        let second = split(dir.path(), "data.txt").expect("split again");
        assert_eq!(first, second);
    }

    #[test]
    fn test_split_empty_file_yields_no_chunks() {
        let (dir, _) = store_with_file(0);
        let chunks = split(dir.path(), "data.txt").expect("split");
        assert!(chunks.is_empty());
        assert_eq!(local_chunk_count(dir.path()).expect("count"), 0);
    }

    #[test]
    fn test_last_chunk_is_short_and_non_empty() {
        let (dir, _) = store_with_file(CHUNK_SIZE as usize + 1);
        let chunks = split(dir.path(), "data.txt").expect("split");
        assert_eq!(chunks.len(), 2);
        let last = fs::read(dir.path().join(&chunks[1].name)).expect("read");
        assert_eq!(last.len(), 1);
    }

    #[test]
    fn test_assemble_stops_at_first_missing_index() {
        let (dir, payload) = store_with_file(5 * CHUNK_SIZE as usize / 2);
        split(dir.path(), "data.txt").expect("split");
        fs::remove_file(dir.path().join(chunk_name("data.txt", 1)))
            .expect("remove");

        let assembled = assemble(dir.path(), "data.txt").expect("assemble");
        // only chunk 0 made it in
        assert_eq!(
            fs::read(assembled).expect("read"),
            &payload[..CHUNK_SIZE as usize]
        );
    }

    #[test]
    fn test_local_chunk_count_counts_all_files() {
        let (dir, _) = store_with_file(3 * CHUNK_SIZE as usize);
        split(dir.path(), "data.txt").expect("split");
        // a foreign chunk from another file counts too
        fs::write(dir.path().join("other.txt.chunk0"), b"x").expect("write");
        // non-chunk files don't
        fs::write(dir.path().join("notes.txt"), b"x").expect("write");

        assert_eq!(local_chunk_count(dir.path()).expect("count"), 4);
    }

    #[test]
    fn test_checked_chunk_path() {
        let dir = Path::new("/store");
        assert!(checked_chunk_path(dir, "data.txt.chunk0").is_ok());
        assert!(checked_chunk_path(dir, "").is_err());
        assert!(checked_chunk_path(dir, "../etc/passwd").is_err());
        assert!(checked_chunk_path(dir, "/etc/passwd").is_err());
        assert!(checked_chunk_path(dir, "a/b.chunk0").is_err());
        assert!(checked_chunk_path(dir, "a\\b.chunk0").is_err());
        assert!(checked_chunk_path(dir, ".hidden").is_err());
    }
}
