//! Streaming file hashing for the integrity monitor.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Files are read in chunks of this size so hashing never holds a whole file
/// in memory.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Hash the contents of `path`, returning an algorithm-prefixed digest of the
/// form `sha256:<hex>`.
///
/// Open and read failures come back as plain [`io::Error`]s; the caller
/// decides whether a missing or unreadable file is fatal.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn identical_contents_hash_identically() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"the same bytes").unwrap();
        fs::write(&b, b"the same bytes").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn single_byte_change_alters_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"the same bytes").unwrap();
        fs::write(&b, b"the same bytez").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn digest_is_algorithm_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"").unwrap();
        let digest = hash_file(&path).unwrap();
        assert!(digest.starts_with("sha256:"));
        // 32 bytes of sha256 as hex
        assert_eq!(digest.len(), "sha256:".len() + 64);
    }

    #[test]
    fn hashing_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big");
        fs::write(&big, vec![0xabu8; HASH_CHUNK_SIZE * 2 + 17]).unwrap();
        let first = hash_file(&big).unwrap();
        let second = hash_file(&big).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_is_a_soft_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
