//! Rolling window hash (BuzHash) and the chunk boundary detector built on it.
//!
//! The detector is a two-state machine: bytes accumulate into the current chunk
//! until either the hard maximum is hit or, past the minimum, the low
//! `filter_bits` bits of the rolling hash are all set.

use crate::config::ChunkerConfig;
use crate::error::{ArchiveError, Result};

/// Seed for the BuzHash byte table. Changing it changes every chunk boundary.
pub const BUZHASH_SEED: u32 = 0x1032_4195;

/// An O(1)-per-byte hash over a fixed window of the most recent bytes.
pub trait RollingHash: Send {
    /// Slide the window by one byte and return the new hash
    fn push(&mut self, byte: u8) -> u32;

    /// Current hash value
    fn sum(&self) -> u32;

    /// Forget all bytes, keeping the window allocation
    fn reset(&mut self);

    /// Window length in bytes
    fn window_size(&self) -> usize;
}

/// Cyclic-polynomial rolling hash.
#[derive(Clone)]
pub struct BuzHash {
    table: [u32; 256],
    window: Vec<u8>,
    pos: usize,
    filled: usize,
    hash: u32,
    out_rotation: u32,
}

impl BuzHash {
    /// Create a hasher over `window_size` bytes with a table derived from `seed`
    pub fn new(window_size: usize, seed: u32) -> Result<Self> {
        if window_size == 0 {
            return Err(ArchiveError::InvalidParameters(
                "rolling hash window must be non-zero".into(),
            ));
        }
        Ok(Self {
            table: byte_table(seed),
            window: vec![0u8; window_size],
            pos: 0,
            filled: 0,
            hash: 0,
            out_rotation: (window_size % 32) as u32,
        })
    }

    /// True once a full window has been seen since the last reset
    pub fn is_full(&self) -> bool {
        self.filled == self.window.len()
    }
}

impl RollingHash for BuzHash {
    #[inline]
    fn push(&mut self, byte: u8) -> u32 {
        let incoming = self.table[byte as usize];
        if self.is_full() {
            let outgoing = self.table[self.window[self.pos] as usize];
            self.hash = self.hash.rotate_left(1) ^ outgoing.rotate_left(self.out_rotation) ^ incoming;
        } else {
            self.hash = self.hash.rotate_left(1) ^ incoming;
            self.filled += 1;
        }
        self.window[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.window.len() {
            self.pos = 0;
        }
        self.hash
    }

    fn sum(&self) -> u32 {
        self.hash
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.filled = 0;
        self.hash = 0;
    }

    fn window_size(&self) -> usize {
        self.window.len()
    }
}

/// xorshift32 expansion of the seed into one 32-bit value per byte.
fn byte_table(seed: u32) -> [u32; 256] {
    let mut state = if seed == 0 { BUZHASH_SEED } else { seed };
    let mut table = [0u32; 256];
    for entry in table.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *entry = state;
    }
    table
}

/// Detector state between two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Bytes are being added to the current chunk
    Accumulating,
    /// The last byte closed a chunk; the next byte starts a new one
    BoundaryEmitted,
}

/// Decides chunk cut points from the rolling hash and the size bounds.
pub struct BoundaryDetector<H: RollingHash = BuzHash> {
    hasher: H,
    mask: u32,
    min_size: usize,
    max_size: usize,
    feed_from: usize,
    len: usize,
    state: DetectorState,
}

impl BoundaryDetector<BuzHash> {
    /// Detector with the default BuzHash over `config.window_size` bytes
    pub fn new(config: &ChunkerConfig) -> Result<Self> {
        Self::with_hasher(BuzHash::new(config.window_size, BUZHASH_SEED)?, config)
    }
}

impl<H: RollingHash> BoundaryDetector<H> {
    /// Detector driven by a caller-supplied rolling hash
    pub fn with_hasher(hasher: H, config: &ChunkerConfig) -> Result<Self> {
        config.validate()?;
        if hasher.window_size() > config.min_size {
            return Err(ArchiveError::InvalidParameters(format!(
                "hash window {} does not fit in min chunk size {}",
                hasher.window_size(),
                config.min_size
            )));
        }
        Ok(Self {
            mask: u32::MAX >> (32 - config.filter_bits),
            min_size: config.min_size,
            max_size: config.max_size,
            feed_from: config.min_size - hasher.window_size(),
            hasher,
            len: 0,
            state: DetectorState::Accumulating,
        })
    }

    /// Account for one more byte; returns true if a chunk ends after it.
    #[inline]
    pub fn push(&mut self, byte: u8) -> bool {
        self.state = DetectorState::Accumulating;
        self.len += 1;
        // Bytes further than one window before the minimum can never influence a cut.
        if self.len > self.feed_from {
            self.hasher.push(byte);
        }
        if self.len < self.min_size {
            return false;
        }
        let cut = self.len >= self.max_size || self.hasher.sum() & self.mask == self.mask;
        if cut {
            self.reset();
            self.state = DetectorState::BoundaryEmitted;
        }
        cut
    }

    /// Bytes accumulated in the current chunk
    pub fn accumulated(&self) -> usize {
        self.len
    }

    /// Current state
    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Drop the current accumulation, e.g. after an end-of-stream flush
    pub fn reset(&mut self) {
        self.len = 0;
        self.hasher.reset();
        self.state = DetectorState::Accumulating;
    }
}
