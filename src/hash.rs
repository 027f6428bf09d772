//! Content hashing, abstracted behind a trait per Design Notes so the
//! texture pipeline is not hard-wired to a single digest algorithm.

use sha2::{Digest, Sha256};

pub const DIGEST_BYTES: usize = 32;

/// A content hasher producing a fixed-size digest from a byte stream.
pub trait Hasher: Send + Sync {
    fn digest(&self, data: &[u8]) -> [u8; DIGEST_BYTES];
}

/// SHA-256-backed implementation, matching `texture_converter.h`'s
/// `sha256_provider`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn digest(&self, data: &[u8]) -> [u8; DIGEST_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut out = [0u8; DIGEST_BYTES];
        out.copy_from_slice(&result);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let hasher = Sha256Hasher;
        let digest = hasher.digest(b"abc");
        let expected = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
            0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
            0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(digest, expected);
    }
}
