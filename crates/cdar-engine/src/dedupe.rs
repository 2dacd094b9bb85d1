//! Content-addressable deduplication index.
//!
//! Maps a chunk checksum to the slot of the descriptor that first carried it.
//! Two chunks with equal (truncated) checksums are assumed byte-identical;
//! the bytes are never compared.

use crate::fingerprint::Checksum;
use std::collections::HashMap;

/// Outcome of offering a chunk to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting: the chunk must be stored, its descriptor lives at this slot
    New(usize),
    /// Repeat sighting: the offset was appended to the descriptor at this slot
    Repeat(usize),
}

impl Admission {
    /// Descriptor slot for this chunk
    pub fn slot(&self) -> usize {
        match self {
            Admission::New(slot) | Admission::Repeat(slot) => *slot,
        }
    }

    /// True if the chunk needs to be stored
    pub fn is_new(&self) -> bool {
        matches!(self, Admission::New(_))
    }
}

/// A unique chunk seen during packing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedChunk {
    /// Truncated content checksum
    pub checksum: Checksum,
    /// Decoded length
    pub source_size: u64,
    /// Ascending source offsets where this content occurs
    pub source_offsets: Vec<u64>,
}

/// In-order deduplication index. Slots are assigned in first-occurrence order.
#[derive(Debug, Default)]
pub struct DedupIndex {
    slots: HashMap<Checksum, usize>,
    chunks: Vec<IndexedChunk>,
}

impl DedupIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer the chunk at `offset`. Callers must offer chunks in ascending offset order.
    pub fn admit(&mut self, checksum: Checksum, offset: u64, source_size: u64) -> Admission {
        if let Some(&slot) = self.slots.get(&checksum) {
            self.chunks[slot].source_offsets.push(offset);
            return Admission::Repeat(slot);
        }
        let slot = self.chunks.len();
        self.slots.insert(checksum.clone(), slot);
        self.chunks.push(IndexedChunk {
            checksum,
            source_size,
            source_offsets: vec![offset],
        });
        Admission::New(slot)
    }

    /// Returns true if this checksum has been seen
    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.slots.contains_key(checksum)
    }

    /// Number of times a checksum has been seen (0 if never)
    pub fn occurrences(&self, checksum: &Checksum) -> usize {
        self.slots
            .get(checksum)
            .map(|&slot| self.chunks[slot].source_offsets.len())
            .unwrap_or(0)
    }

    /// Number of unique chunks tracked
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Unique chunks in first-occurrence order
    pub fn into_chunks(self) -> Vec<IndexedChunk> {
        self.chunks
    }
}
