//! SHA-256 digests over byte slices and file streams

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Compute the lowercase hex SHA-256 of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Check whether a string is a complete lowercase hex object id
/// (40 hex digits for SHA-1, 64 for SHA-256).
pub fn is_full_object_id(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64)
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_bytes_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"print('hi')\n").unwrap();

        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(b"print('hi')\n"));
    }

    #[test]
    fn test_is_full_object_id() {
        assert!(is_full_object_id(&"a".repeat(40)));
        assert!(is_full_object_id(&"0".repeat(64)));
        assert!(!is_full_object_id("main"));
        assert!(!is_full_object_id(&"A".repeat(40)));
        assert!(!is_full_object_id(&"a".repeat(39)));
        assert!(!is_full_object_id("refs/heads/main"));
    }
}
