//! Shared SHA-256 hex digest utility.
//!
//! Used for unit fingerprints and dependency-declaration digests.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute a SHA-256 hex digest over several byte slices, separated by NUL.
///
/// The separator keeps `["ab", "c"]` and `["a", "bc"]` from colliding.
pub fn sha256_hex_parts<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn consistent_output() {
        let data = b"hello world";
        assert_eq!(sha256_hex(data), sha256_hex(data));
        assert_eq!(sha256_hex(data).len(), 64);
    }

    #[test]
    fn parts_are_separated() {
        let a = sha256_hex_parts([b"ab".as_slice(), b"c".as_slice()]);
        let b = sha256_hex_parts([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn single_part_matches_plain_digest() {
        assert_eq!(sha256_hex_parts([b"xyz".as_slice()]), sha256_hex(b"xyz"));
    }
}
