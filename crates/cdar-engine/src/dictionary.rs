//! Chunk dictionary: the persisted protobuf contract between packer and unpacker.
//!
//! Message layout (proto3):
//!
//! ```text
//! message ChunkerParameters {
//!   uint32 chunk_filter_bits = 1;
//!   uint32 min_chunk_size = 2;
//!   uint32 max_chunk_size = 3;
//!   uint32 hash_window_size = 4;
//!   uint32 chunk_hash_length = 5;
//! }
//! message ChunkCompression {
//!   enum CompressionType { NONE = 0; LZ4 = 1; ZSTD = 2; LZMA = 3; }
//!   CompressionType compression = 1;
//!   uint32 compression_level = 2;
//! }
//! message ChunkDescriptor {
//!   bytes checksum = 1;
//!   ChunkCompression compression = 2;
//!   uint64 archive_size = 3;
//!   uint64 archive_offset = 4;
//!   uint64 source_size = 5;
//!   repeated uint64 source_offsets = 6;
//! }
//! message ChunkDictionary {
//!   string application_version = 1;
//!   bytes source_checksum = 2;
//!   uint64 source_total_size = 3;
//!   oneof chunk_data_location {
//!     string external = 4;
//!     string per_chunk = 5;
//!   }
//!   ChunkerParameters chunker_params = 6;
//!   repeated ChunkDescriptor chunk_descriptors = 7;
//! }
//! ```
//!
//! Unset `chunk_data_location` means chunk data is embedded in the archive.

use crate::compression::CompressionAlgorithm;
use crate::config::ChunkerConfig;
use crate::error::{ArchiveError, Result};
use crate::fingerprint::{to_hex, Checksum};
use prost::Message;
use std::collections::HashSet;
use std::path::PathBuf;

/// Version string written into every dictionary
pub const APPLICATION_VERSION: &str = concat!("cdar ", env!("CARGO_PKG_VERSION"));

/// Chunking parameters as persisted
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct ChunkerParameters {
    /// Low hash bits that must be set for a cut
    #[prost(uint32, tag = "1")]
    pub chunk_filter_bits: u32,
    /// Minimum chunk size
    #[prost(uint32, tag = "2")]
    pub min_chunk_size: u32,
    /// Maximum chunk size
    #[prost(uint32, tag = "3")]
    pub max_chunk_size: u32,
    /// Rolling hash window
    #[prost(uint32, tag = "4")]
    pub hash_window_size: u32,
    /// Stored checksum length
    #[prost(uint32, tag = "5")]
    pub chunk_hash_length: u32,
}

/// Wire tag for the chunk codec
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CompressionType {
    /// Stored raw
    None = 0,
    /// LZ4 block
    Lz4 = 1,
    /// Zstandard frame
    Zstd = 2,
    /// LZMA in an xz container
    Lzma = 3,
}

/// Codec applied to one stored chunk
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct ChunkCompression {
    /// Codec tag
    #[prost(enumeration = "CompressionType", tag = "1")]
    pub compression: i32,
    /// Codec level (unused by LZ4)
    #[prost(uint32, tag = "2")]
    pub compression_level: u32,
}

/// One unique chunk and every place it occurs in the source
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ChunkDescriptor {
    /// Truncated BLAKE3 of the decoded chunk
    #[prost(bytes = "vec", tag = "1")]
    pub checksum: Vec<u8>,
    /// Absent when stored raw
    #[prost(message, optional, tag = "2")]
    pub compression: Option<ChunkCompression>,
    /// Stored length (embedded and external stores)
    #[prost(uint64, tag = "3")]
    pub archive_size: u64,
    /// Stored offset (embedded and external stores)
    #[prost(uint64, tag = "4")]
    pub archive_offset: u64,
    /// Decoded length
    #[prost(uint64, tag = "5")]
    pub source_size: u64,
    /// Ascending offsets in the source where this content occurs
    #[prost(uint64, repeated, tag = "6")]
    pub source_offsets: Vec<u64>,
}

/// Where chunk bytes live when not embedded in the archive
#[derive(Clone, PartialEq, Eq, prost::Oneof)]
pub enum ChunkDataLocation {
    /// One blob file holding all chunks back to back
    #[prost(string, tag = "4")]
    External(String),
    /// Directory with one file per chunk, named by hex checksum
    #[prost(string, tag = "5")]
    PerChunk(String),
}

/// Everything needed to rebuild one source file from stored chunks
#[derive(Clone, PartialEq, Message)]
pub struct ChunkDictionary {
    /// Producer identity; informational only
    #[prost(string, tag = "1")]
    pub application_version: String,
    /// BLAKE3 of the whole source
    #[prost(bytes = "vec", tag = "2")]
    pub source_checksum: Vec<u8>,
    /// Source length in bytes
    #[prost(uint64, tag = "3")]
    pub source_total_size: u64,
    /// Unset means embedded
    #[prost(oneof = "ChunkDataLocation", tags = "4, 5")]
    pub chunk_data_location: Option<ChunkDataLocation>,
    /// Parameters the source was chunked with
    #[prost(message, optional, tag = "6")]
    pub chunker_params: Option<ChunkerParameters>,
    /// Unique chunks in first-occurrence order
    #[prost(message, repeated, tag = "7")]
    pub chunk_descriptors: Vec<ChunkDescriptor>,
}

/// Resolved placement of chunk data, as a tagged union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLocation {
    /// Inside the archive, after the header
    Embedded,
    /// A single external blob file
    External(PathBuf),
    /// A directory of per-chunk files
    PerChunk(PathBuf),
}

impl DataLocation {
    /// Wire form of this location
    pub fn to_wire(&self) -> Option<ChunkDataLocation> {
        match self {
            DataLocation::Embedded => None,
            DataLocation::External(p) => Some(ChunkDataLocation::External(path_string(p))),
            DataLocation::PerChunk(p) => Some(ChunkDataLocation::PerChunk(path_string(p))),
        }
    }

    /// Location recorded in a dictionary
    pub fn from_wire(wire: Option<&ChunkDataLocation>) -> Self {
        match wire {
            None => DataLocation::Embedded,
            Some(ChunkDataLocation::External(p)) => DataLocation::External(PathBuf::from(p)),
            Some(ChunkDataLocation::PerChunk(p)) => DataLocation::PerChunk(PathBuf::from(p)),
        }
    }
}

impl std::fmt::Display for DataLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataLocation::Embedded => write!(f, "embedded"),
            DataLocation::External(p) => write!(f, "external file {}", p.display()),
            DataLocation::PerChunk(p) => write!(f, "chunk directory {}", p.display()),
        }
    }
}

fn path_string(p: &std::path::Path) -> String {
    p.to_string_lossy().into_owned()
}

impl From<&ChunkerConfig> for ChunkerParameters {
    fn from(c: &ChunkerConfig) -> Self {
        Self {
            chunk_filter_bits: c.filter_bits,
            min_chunk_size: c.min_size as u32,
            max_chunk_size: c.max_size as u32,
            hash_window_size: c.window_size as u32,
            chunk_hash_length: c.hash_length as u32,
        }
    }
}

impl From<&ChunkerParameters> for ChunkerConfig {
    fn from(p: &ChunkerParameters) -> Self {
        Self {
            filter_bits: p.chunk_filter_bits,
            min_size: p.min_chunk_size as usize,
            max_size: p.max_chunk_size as usize,
            window_size: p.hash_window_size as usize,
            hash_length: p.chunk_hash_length as usize,
        }
    }
}

impl ChunkCompression {
    /// Wire entry for an applied codec; None when stored raw
    pub fn for_algorithm(algo: CompressionAlgorithm) -> Option<Self> {
        match algo {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Lz4 => Some(Self {
                compression: CompressionType::Lz4 as i32,
                compression_level: 0,
            }),
            CompressionAlgorithm::Zstd { level } => Some(Self {
                compression: CompressionType::Zstd as i32,
                compression_level: level as u32,
            }),
            CompressionAlgorithm::Lzma { level } => Some(Self {
                compression: CompressionType::Lzma as i32,
                compression_level: level,
            }),
        }
    }

    /// Codec to decode with
    pub fn algorithm(&self) -> Result<CompressionAlgorithm> {
        match CompressionType::try_from(self.compression) {
            Ok(CompressionType::None) => Ok(CompressionAlgorithm::None),
            Ok(CompressionType::Lz4) => Ok(CompressionAlgorithm::Lz4),
            Ok(CompressionType::Zstd) => Ok(CompressionAlgorithm::Zstd {
                level: self.compression_level as i32,
            }),
            Ok(CompressionType::Lzma) => Ok(CompressionAlgorithm::Lzma {
                level: self.compression_level,
            }),
            Err(_) => Err(ArchiveError::Codec(format!(
                "unknown compression type {}",
                self.compression
            ))),
        }
    }
}

impl ChunkDescriptor {
    /// Codec the stored bytes were written with
    pub fn algorithm(&self) -> Result<CompressionAlgorithm> {
        match &self.compression {
            None => Ok(CompressionAlgorithm::None),
            Some(c) => c.algorithm(),
        }
    }

    /// Checksum as a typed value
    pub fn checksum(&self) -> Checksum {
        Checksum::from_bytes(&self.checksum)
    }

    /// Hex checksum, for logs and per-chunk file names
    pub fn checksum_hex(&self) -> String {
        to_hex(&self.checksum)
    }
}

impl ChunkDictionary {
    /// Serialize to the protobuf wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserialize from the protobuf wire format. Unknown fields are skipped.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }

    /// Where the chunk bytes live
    pub fn data_location(&self) -> DataLocation {
        DataLocation::from_wire(self.chunk_data_location.as_ref())
    }

    /// Chunking parameters, if recorded
    pub fn chunker_config(&self) -> Option<ChunkerConfig> {
        self.chunker_params.as_ref().map(ChunkerConfig::from)
    }

    /// Number of chunk placements (sum of all offsets)
    pub fn placement_count(&self) -> usize {
        self.chunk_descriptors
            .iter()
            .map(|d| d.source_offsets.len())
            .sum()
    }

    /// Check every structural invariant required before reconstruction writes anything.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(ArchiveError::DictionaryInvalid(msg)) };

        if self.source_checksum.is_empty() {
            return invalid("missing source checksum".into());
        }
        let mut seen = HashSet::with_capacity(self.chunk_descriptors.len());
        let mut spans = Vec::with_capacity(self.placement_count());
        for (i, d) in self.chunk_descriptors.iter().enumerate() {
            if d.checksum.is_empty() {
                return invalid(format!("descriptor {i} has no checksum"));
            }
            if !seen.insert(d.checksum.as_slice()) {
                return invalid(format!("duplicate descriptor for chunk {}", d.checksum_hex()));
            }
            if d.source_offsets.is_empty() {
                return invalid(format!("chunk {} is never referenced", d.checksum_hex()));
            }
            if d.source_size == 0 {
                return invalid(format!("chunk {} is empty", d.checksum_hex()));
            }
            if d.source_offsets.windows(2).any(|w| w[0] >= w[1]) {
                return invalid(format!(
                    "offsets of chunk {} are not ascending",
                    d.checksum_hex()
                ));
            }
            for &offset in &d.source_offsets {
                spans.push((offset, d.source_size));
            }
        }

        spans.sort_unstable();
        let mut cursor = 0u64;
        for (offset, size) in spans {
            if offset != cursor {
                return if offset < cursor {
                    invalid(format!("chunks overlap at source offset {offset}"))
                } else {
                    invalid(format!("gap in source at [{cursor}, {offset})"))
                };
            }
            cursor = offset
                .checked_add(size)
                .ok_or_else(|| ArchiveError::DictionaryInvalid("chunk range overflows".into()))?;
        }
        if cursor != self.source_total_size {
            return invalid(format!(
                "chunks cover {cursor} bytes, source is {} bytes",
                self.source_total_size
            ));
        }
        Ok(())
    }

    /// Summary for display
    pub fn summary(&self) -> DictionarySummary {
        let unique_bytes: u64 = self.chunk_descriptors.iter().map(|d| d.source_size).sum();
        let stored_bytes: u64 = self.chunk_descriptors.iter().map(|d| d.archive_size).sum();
        DictionarySummary {
            application_version: self.application_version.clone(),
            source_checksum: to_hex(&self.source_checksum),
            source_total_size: self.source_total_size,
            location: self.data_location(),
            chunker: self.chunker_config(),
            unique_chunks: self.chunk_descriptors.len(),
            total_chunks: self.placement_count(),
            unique_bytes,
            stored_bytes,
            compressed_chunks: self
                .chunk_descriptors
                .iter()
                .filter(|d| d.compression.is_some())
                .count(),
        }
    }
}

/// Human-oriented facts about a dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct DictionarySummary {
    /// Producer identity
    pub application_version: String,
    /// Hex source checksum
    pub source_checksum: String,
    /// Source length
    pub source_total_size: u64,
    /// Where chunk data lives
    pub location: DataLocation,
    /// Chunking parameters, if recorded
    pub chunker: Option<ChunkerConfig>,
    /// Number of descriptors
    pub unique_chunks: usize,
    /// Number of placements
    pub total_chunks: usize,
    /// Sum of unique chunk sizes
    pub unique_bytes: u64,
    /// Sum of stored sizes (zero for per-chunk stores)
    pub stored_bytes: u64,
    /// Descriptors carrying a codec entry
    pub compressed_chunks: usize,
}

impl std::fmt::Display for DictionarySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Created by:      {}", self.application_version)?;
        writeln!(f, "Source checksum: {}", self.source_checksum)?;
        writeln!(f, "Source size:     {} bytes", self.source_total_size)?;
        writeln!(f, "Chunk data:      {}", self.location)?;
        writeln!(
            f,
            "Chunks:          {} total, {} unique, {} compressed",
            self.total_chunks, self.unique_chunks, self.compressed_chunks
        )?;
        writeln!(f, "Unique bytes:    {}", self.unique_bytes)?;
        write!(f, "Stored bytes:    {}", self.stored_bytes)?;
        if let Some(c) = &self.chunker {
            write!(
                f,
                "\nChunker:         avg {} / min {} / max {} bytes, window {}, hash length {}",
                c.avg_size(),
                c.min_size,
                c.max_size,
                c.window_size,
                c.hash_length
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(tag: u8, size: u64, offsets: &[u64]) -> ChunkDescriptor {
        ChunkDescriptor {
            checksum: vec![tag; 8],
            compression: None,
            archive_size: size,
            archive_offset: 0,
            source_size: size,
            source_offsets: offsets.to_vec(),
        }
    }

    fn dictionary(total: u64, descriptors: Vec<ChunkDescriptor>) -> ChunkDictionary {
        ChunkDictionary {
            application_version: APPLICATION_VERSION.into(),
            source_checksum: vec![1; 32],
            source_total_size: total,
            chunk_data_location: None,
            chunker_params: Some((&ChunkerConfig::default()).into()),
            chunk_descriptors: descriptors,
        }
    }

    #[test]
    fn exact_tiling_is_valid() {
        let d = dictionary(
            100,
            vec![descriptor(1, 30, &[0, 60]), descriptor(2, 30, &[30]), descriptor(3, 10, &[90])],
        );
        d.validate().unwrap();
        assert_eq!(d.placement_count(), 4);
    }

    #[test]
    fn gap_is_rejected() {
        let d = dictionary(100, vec![descriptor(1, 40, &[0]), descriptor(2, 50, &[50])]);
        assert!(matches!(d.validate(), Err(ArchiveError::DictionaryInvalid(_))));
    }

    #[test]
    fn overlap_is_rejected() {
        let d = dictionary(100, vec![descriptor(1, 60, &[0]), descriptor(2, 50, &[50])]);
        assert!(matches!(d.validate(), Err(ArchiveError::DictionaryInvalid(_))));
    }

    #[test]
    fn short_coverage_is_rejected() {
        let d = dictionary(100, vec![descriptor(1, 50, &[0]), descriptor(2, 40, &[50])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn duplicate_checksum_is_rejected() {
        let d = dictionary(100, vec![descriptor(1, 50, &[0]), descriptor(1, 50, &[50])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn unreferenced_descriptor_is_rejected() {
        let d = dictionary(50, vec![descriptor(1, 50, &[0]), descriptor(2, 10, &[])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn missing_source_checksum_is_rejected() {
        let mut d = dictionary(50, vec![descriptor(1, 50, &[0])]);
        d.source_checksum.clear();
        assert!(d.validate().is_err());
    }

    #[test]
    fn empty_source_is_valid() {
        dictionary(0, Vec::new()).validate().unwrap();
    }

    #[test]
    fn wire_roundtrip_keeps_offset_order_and_location() {
        let mut d = dictionary(100, vec![descriptor(7, 25, &[0, 25, 50, 75])]);
        d.chunk_data_location = Some(ChunkDataLocation::PerChunk("store.d".into()));
        d.chunk_descriptors[0].compression =
            ChunkCompression::for_algorithm(CompressionAlgorithm::Zstd { level: 9 });
        let decoded = ChunkDictionary::from_bytes(&d.to_bytes()).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.chunk_descriptors[0].source_offsets, vec![0, 25, 50, 75]);
        assert_eq!(
            decoded.data_location(),
            DataLocation::PerChunk(PathBuf::from("store.d"))
        );
        assert_eq!(
            decoded.chunk_descriptors[0].algorithm().unwrap(),
            CompressionAlgorithm::Zstd { level: 9 }
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let d = dictionary(10, vec![descriptor(1, 10, &[0])]);
        let mut buf = d.to_bytes();
        // field 99, varint 42
        prost::encoding::uint64::encode(99, &42, &mut buf);
        let decoded = ChunkDictionary::from_bytes(&buf).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn garbage_is_dictionary_invalid() {
        assert!(matches!(
            ChunkDictionary::from_bytes(&[0xff, 0xff, 0xff]),
            Err(ArchiveError::DictionaryInvalid(_))
        ));
    }

    #[test]
    fn unknown_codec_tag_is_codec_error() {
        let c = ChunkCompression {
            compression: 42,
            compression_level: 0,
        };
        assert!(matches!(c.algorithm(), Err(ArchiveError::Codec(_))));
    }

    #[test]
    fn lzma_entry_keeps_tag_and_level() {
        let entry = ChunkCompression::for_algorithm(CompressionAlgorithm::Lzma { level: 7 }).unwrap();
        assert_eq!(entry.compression, 3);
        assert_eq!(entry.compression_level, 7);
        assert_eq!(entry.algorithm().unwrap(), CompressionAlgorithm::Lzma { level: 7 });
    }

    #[test]
    fn raw_chunks_have_no_compression_entry() {
        assert!(ChunkCompression::for_algorithm(CompressionAlgorithm::None).is_none());
    }

    #[test]
    fn params_convert_both_ways() {
        let config = ChunkerConfig {
            filter_bits: 12,
            min_size: 1024,
            max_size: 65536,
            window_size: 32,
            hash_length: 20,
        };
        let wire = ChunkerParameters::from(&config);
        assert_eq!(ChunkerConfig::from(&wire), config);
    }

    #[test]
    fn summary_counts() {
        let d = dictionary(100, vec![descriptor(1, 50, &[0, 50])]);
        let s = d.summary();
        assert_eq!(s.unique_chunks, 1);
        assert_eq!(s.total_chunks, 2);
        assert_eq!(s.unique_bytes, 50);
        assert_eq!(s.location, DataLocation::Embedded);
        assert!(s.to_string().contains("2 total, 1 unique"));
    }
}
