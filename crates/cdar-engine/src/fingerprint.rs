//! Content fingerprinting: BLAKE3 chunk checksums and whole-source hashing

use serde::{Deserialize, Serialize};

/// Native BLAKE3 output length; the upper bound for truncated chunk checksums.
pub const CHECKSUM_LEN: usize = 32;

/// A (possibly truncated) BLAKE3 checksum identifying a chunk's content. Used as the dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    /// Wrap raw checksum bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Return the checksum as a lowercase hex string
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length checksum
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Lowercase hex encoding of a byte slice
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Strong content hash used for chunk identity.
/// Kept apart from the rolling hash: this one must resist collisions, not update cheaply.
pub trait ChunkHasher: Send + Sync {
    /// Full-length digest of `data`
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Native output length in bytes
    fn output_len(&self) -> usize;

    /// Digest truncated to `len` bytes
    fn checksum(&self, data: &[u8], len: usize) -> Checksum {
        let mut digest = self.digest(data);
        digest.truncate(len.min(self.output_len()));
        Checksum(digest)
    }
}

/// BLAKE3 chunk hasher
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl ChunkHasher for Blake3Hasher {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        blake3::hash(data).as_bytes().to_vec()
    }

    fn output_len(&self) -> usize {
        CHECKSUM_LEN
    }
}

/// Incremental BLAKE3 over a whole source, fed chunk by chunk.
#[derive(Default)]
pub struct SourceHasher {
    hasher: blake3::Hasher,
    total: u64,
}

impl SourceHasher {
    /// Create an empty source hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next contiguous span of the source
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Finish and return the 32-byte checksum plus total size
    pub fn finalize(&self) -> (Vec<u8>, u64) {
        (self.hasher.finalize().as_bytes().to_vec(), self.total)
    }
}
