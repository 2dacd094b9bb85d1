//! Chunker, pack and unpack configuration

use crate::compression::CompressionAlgorithm;
use crate::error::{ArchiveError, Result};
use crate::fingerprint::CHECKSUM_LEN;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parameters for content-defined chunking and checksum truncation.
/// Recorded in every dictionary so the archive can be re-chunked or verified later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Number of low rolling-hash bits that must be set for a cut (average chunk ~ 2^bits)
    pub filter_bits: u32,
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Rolling hash window in bytes
    pub window_size: usize,
    /// Stored checksum length in bytes
    pub hash_length: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            filter_bits: 16,
            min_size: 16 * 1024,
            max_size: 16 * 1024 * 1024,
            window_size: 16,
            hash_length: CHECKSUM_LEN,
        }
    }
}

impl ChunkerConfig {
    /// Build a config from an average chunk size instead of raw filter bits
    pub fn with_avg_size(
        avg_size: usize,
        min_size: usize,
        max_size: usize,
        window_size: usize,
        hash_length: usize,
    ) -> Result<Self> {
        if min_size > avg_size {
            return Err(ArchiveError::InvalidParameters(format!(
                "min chunk size {min_size} > average chunk size {avg_size}"
            )));
        }
        if max_size < avg_size {
            return Err(ArchiveError::InvalidParameters(format!(
                "max chunk size {max_size} < average chunk size {avg_size}"
            )));
        }
        let config = Self {
            filter_bits: filter_bits_for_avg(avg_size)?,
            min_size,
            max_size,
            window_size,
            hash_length,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants between the sizes
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ArchiveError::InvalidParameters(msg)) };
        if self.filter_bits == 0 || self.filter_bits > 31 {
            return fail(format!("filter bits {} not within 1..=31", self.filter_bits));
        }
        if self.max_size == 0 || self.max_size > u32::MAX as usize {
            return fail(format!("max chunk size {} not within 1..=u32::MAX", self.max_size));
        }
        if self.min_size > self.max_size {
            return fail(format!(
                "min chunk size {} > max chunk size {}",
                self.min_size, self.max_size
            ));
        }
        if self.window_size == 0 {
            return fail("hash window size must be non-zero".into());
        }
        if self.window_size > self.min_size {
            return fail(format!(
                "hash window {} does not fit in min chunk size {}",
                self.window_size, self.min_size
            ));
        }
        if self.hash_length == 0 || self.hash_length > CHECKSUM_LEN {
            return fail(format!(
                "hash length {} not within 1..={CHECKSUM_LEN}",
                self.hash_length
            ));
        }
        Ok(())
    }

    /// Expected average chunk size for these parameters
    pub fn avg_size(&self) -> usize {
        1usize << self.filter_bits
    }
}

/// Configuration for a packing run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Chunking parameters
    pub chunker: ChunkerConfig,
    /// Codec applied to each unique chunk
    pub compression: CompressionAlgorithm,
    /// Hashing/compression tasks allowed in flight per stage
    pub workers: usize,
    /// Capacity of the chunker output channel
    pub queue_depth: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            compression: CompressionAlgorithm::Zstd { level: 6 },
            workers: default_workers(),
            queue_depth: 64,
        }
    }
}

impl PackConfig {
    /// Validate all nested parameters
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        self.compression.validate()?;
        if self.workers == 0 || self.queue_depth == 0 {
            return Err(ArchiveError::InvalidParameters(
                "workers and queue depth must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an unpacking run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackConfig {
    /// Descriptors fetched and decoded concurrently
    pub workers: usize,
    /// Check each decoded chunk against its descriptor checksum
    pub verify_chunks: bool,
    /// Check the reconstructed output against the source checksum
    pub verify_output: bool,
    /// Local files scanned for matching chunks before the store is read
    pub seeds: Vec<PathBuf>,
}

impl Default for UnpackConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            verify_chunks: true,
            verify_output: true,
            seeds: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Filter bits giving an average chunk size of the largest power of two <= `avg_size`
pub fn filter_bits_for_avg(avg_size: usize) -> Result<u32> {
    if avg_size < 2 {
        return Err(ArchiveError::InvalidParameters(format!(
            "average chunk size {avg_size} too small"
        )));
    }
    Ok((usize::BITS - 1 - avg_size.leading_zeros()).min(31))
}

/// Parse a size such as `64KiB`, `16MiB` or `512`
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| ArchiveError::InvalidParameters(format!("invalid size '{s}'")))?;
    let multiplier: usize = match unit.trim() {
        "" | "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        other => {
            return Err(ArchiveError::InvalidParameters(format!(
                "invalid size unit '{other}'"
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ArchiveError::InvalidParameters(format!("size '{s}' overflows")))
}
