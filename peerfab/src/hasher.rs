//! Content hashing: SHA-256, hex encoded lowercase.
//!
//! Chunk checksums and the per-file terminal checksum both come from here,
//! so every peer produces byte-identical digests for identical input.

use std::{fs::File, io::Read, path::Path};

use sha2::{Digest, Sha256};

/// The hex digest of an empty byte string; the terminal checksum of a zero
/// length file.
pub const EMPTY_DIGEST: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Hashes the given bytes and returns the lowercase 64 character hex
/// digest.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hashes a whole file by streaming it and returns the lowercase hex
/// digest.
///
/// This is used for terminal checksums of files that may be large, so the
/// file is never loaded into memory whole.
pub fn digest_file(path: impl AsRef<Path>) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read_count = file.read(&mut buf)?;
        if read_count == 0 {
            break;
        }
        hasher.update(&buf[..read_count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_digest_known_vectors() {
        assert_eq!(digest(b""), EMPTY_DIGEST);
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_file_matches_digest() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        // larger than the streaming buffer so more than one read is needed
        let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).expect("write");

        let streamed = digest_file(file.path()).expect("digest_file");
        assert_eq!(streamed, digest(&payload));
    }

    #[test]
    fn test_digest_file_missing() {
        assert!(digest_file("/definitely/not/here").is_err());
    }
}
