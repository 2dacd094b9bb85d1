#![warn(missing_docs)]

//! cdar engine: content-defined chunking (BuzHash), dedupe (BLAKE3), per-chunk compression (LZMA/LZ4/Zstd)
//!
//! Pack path:   Source → Chunk (BuzHash) → Checksum (BLAKE3) → Dedupe → Compress → Store → Dictionary
//! Unpack path: Dictionary → Validate → Store → Decompress → Verify → Scatter-write

pub mod archive;
pub mod cancel;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod dedupe;
pub mod dictionary;
pub mod error;
pub mod fingerprint;
pub mod pack;
pub mod rolling;
pub mod store;
pub mod unpack;

pub use archive::{Archive, StoreConfig};
pub use cancel::{new_cancel_pair, CancelHandle, CancelToken};
pub use chunker::{Chunk, Chunker};
pub use compression::CompressionAlgorithm;
pub use config::{filter_bits_for_avg, parse_size, ChunkerConfig, PackConfig, UnpackConfig};
pub use dedupe::{Admission, DedupIndex};
pub use dictionary::{ChunkDescriptor, ChunkDictionary, DataLocation, DictionarySummary};
pub use error::{ArchiveError, Result};
pub use fingerprint::{Blake3Hasher, ChunkHasher, Checksum, CHECKSUM_LEN};
pub use pack::{PackOutcome, PackStats, Packer};
pub use rolling::{BoundaryDetector, BuzHash, RollingHash};
pub use store::{ChunkStore, EmbeddedStore, ExternalStore, PerChunkStore, Placement};
pub use unpack::{Destination, FileDestination, MemoryDestination, UnpackStats, Unpacker};
