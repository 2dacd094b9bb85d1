//! Packing pipeline: chunk → hash → deduplicate → compress → store → dictionary.
//!
//! Chunking runs on one blocking task feeding a bounded channel. Hashing and
//! compression run on the blocking pool with at most `workers` tasks in flight
//! per stage; their results are put back in order by sequence number before the
//! single-writer dedup stage and the sequential store puts. Output is therefore
//! independent of worker count and scheduling.

use crate::cancel::CancelToken;
use crate::chunker::{Chunk, Chunker};
use crate::compression::{compress_or_raw, CompressionAlgorithm};
use crate::config::PackConfig;
use crate::dedupe::{Admission, DedupIndex};
use crate::dictionary::{ChunkCompression, ChunkDescriptor, ChunkDictionary, APPLICATION_VERSION};
use crate::error::{ArchiveError, Result};
use crate::fingerprint::{Blake3Hasher, ChunkHasher, Checksum, SourceHasher};
use crate::store::{ChunkStore, Placement};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

/// Statistics from a packing run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PackStats {
    /// Total source bytes
    pub input_bytes: u64,
    /// Chunks produced by the chunker
    pub chunks: usize,
    /// Distinct chunks after deduplication
    pub unique_chunks: usize,
    /// Chunks that repeated earlier content
    pub deduplicated_chunks: usize,
    /// Bytes of distinct chunk content
    pub unique_bytes: u64,
    /// Bytes handed to the store
    pub stored_bytes: u64,
}

impl PackStats {
    /// Source bytes per unique byte (1.0 means no duplication)
    pub fn dedup_ratio(&self) -> f64 {
        if self.unique_bytes == 0 {
            1.0
        } else {
            self.input_bytes as f64 / self.unique_bytes as f64
        }
    }

    /// Unique bytes per stored byte
    pub fn compression_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            1.0
        } else {
            self.unique_bytes as f64 / self.stored_bytes as f64
        }
    }
}

/// Result of packing one source
#[derive(Debug, Clone)]
pub struct PackOutcome {
    /// Dictionary describing how to rebuild the source
    pub dictionary: ChunkDictionary,
    /// Run statistics
    pub stats: PackStats,
}

/// Packs a byte stream into a chunk store and produces its dictionary.
pub struct Packer {
    config: PackConfig,
    hasher: Arc<dyn ChunkHasher>,
    cancel: CancelToken,
}

impl Packer {
    /// Create a packer with BLAKE3 chunk checksums
    pub fn new(config: PackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hasher: Arc::new(Blake3Hasher),
            cancel: CancelToken::new(),
        })
    }

    /// Use another strong hash for chunk identity
    pub fn with_hasher(mut self, hasher: Arc<dyn ChunkHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Abort the run when this token is cancelled
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// Pack `source` into `store`.
    #[instrument(skip(self, source, store), fields(compression = %self.config.compression, location = %store.location()))]
    pub async fn pack<R>(&self, source: R, store: &dyn ChunkStore) -> Result<PackOutcome>
    where
        R: Read + Send + 'static,
    {
        let mut chunker = Chunker::new(&self.config.chunker, source)?;
        let (tx, mut rx) = mpsc::channel::<(u64, Chunk)>(self.config.queue_depth);

        let cancel = self.cancel.clone();
        let chunking = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, u64)> {
            let mut source_hash = SourceHasher::new();
            let mut seq = 0u64;
            while let Some(chunk) = chunker.next_chunk()? {
                cancel.check()?;
                source_hash.update(&chunk.data);
                if tx.blocking_send((seq, chunk)).is_err() {
                    // downstream failed; its error is reported instead
                    break;
                }
                seq += 1;
            }
            Ok(source_hash.finalize())
        });

        let mut stages = Stages {
            store,
            cancel: &self.cancel,
            hasher: self.hasher.clone(),
            hash_length: self.config.chunker.hash_length,
            compression: self.config.compression,
            workers: self.config.workers,
            hashing: JoinSet::new(),
            hashed: ReorderBuffer::new(),
            compressing: JoinSet::new(),
            compressed: ReorderBuffer::new(),
            index: DedupIndex::new(),
            placed: Vec::new(),
            stats: PackStats::default(),
        };

        while let Some((seq, chunk)) = rx.recv().await {
            self.cancel.check()?;
            while stages.hashing.len() >= stages.workers {
                stages.finish_hash().await?;
            }
            stages.submit_hash(seq, chunk);
        }
        let (source_checksum, source_total_size) = chunking.await??;

        while !stages.hashing.is_empty() {
            stages.finish_hash().await?;
        }
        while !stages.compressing.is_empty() {
            stages.finish_compress().await?;
        }
        if !stages.hashed.is_empty() || !stages.compressed.is_empty() {
            return Err(ArchiveError::Io(std::io::Error::other(
                "pipeline finished with out-of-order results pending",
            )));
        }
        self.cancel.check()?;
        store.flush().await?;

        let Stages {
            index,
            placed,
            mut stats,
            ..
        } = stages;
        let chunk_descriptors: Vec<ChunkDescriptor> = index
            .into_chunks()
            .into_iter()
            .zip(placed)
            .map(|(chunk, (placement, algo))| ChunkDescriptor {
                checksum: chunk.checksum.as_bytes().to_vec(),
                compression: ChunkCompression::for_algorithm(algo),
                archive_size: placement.archive_size,
                archive_offset: placement.archive_offset,
                source_size: chunk.source_size,
                source_offsets: chunk.source_offsets,
            })
            .collect();

        stats.input_bytes = source_total_size;
        stats.unique_chunks = chunk_descriptors.len();
        stats.deduplicated_chunks = stats.chunks - stats.unique_chunks;

        let dictionary = ChunkDictionary {
            application_version: APPLICATION_VERSION.to_string(),
            source_checksum,
            source_total_size,
            chunk_data_location: store.location().to_wire(),
            chunker_params: Some((&self.config.chunker).into()),
            chunk_descriptors,
        };

        info!(
            input_bytes = stats.input_bytes,
            chunks = stats.chunks,
            unique = stats.unique_chunks,
            stored_bytes = stats.stored_bytes,
            dedup_ratio = stats.dedup_ratio(),
            "pack complete"
        );
        Ok(PackOutcome { dictionary, stats })
    }
}

type Compressed = (Checksum, Vec<u8>, CompressionAlgorithm);

/// Mutable state shared by the in-order stages of one run.
struct Stages<'a> {
    store: &'a dyn ChunkStore,
    cancel: &'a CancelToken,
    hasher: Arc<dyn ChunkHasher>,
    hash_length: usize,
    compression: CompressionAlgorithm,
    workers: usize,
    hashing: JoinSet<(u64, Chunk, Checksum)>,
    hashed: ReorderBuffer<(Chunk, Checksum)>,
    compressing: JoinSet<Result<(u64, Compressed)>>,
    compressed: ReorderBuffer<Compressed>,
    index: DedupIndex,
    placed: Vec<(Placement, CompressionAlgorithm)>,
    stats: PackStats,
}

impl Stages<'_> {
    fn submit_hash(&mut self, seq: u64, chunk: Chunk) {
        let hasher = self.hasher.clone();
        let len = self.hash_length;
        self.hashing.spawn_blocking(move || {
            let checksum = hasher.checksum(&chunk.data, len);
            (seq, chunk, checksum)
        });
    }

    async fn finish_hash(&mut self) -> Result<()> {
        let Some(joined) = self.hashing.join_next().await else {
            return Ok(());
        };
        let (seq, chunk, checksum) = joined?;
        self.hashed.insert(seq, (chunk, checksum));
        while let Some((chunk, checksum)) = self.hashed.pop_ready() {
            self.admit(chunk, checksum).await?;
        }
        Ok(())
    }

    async fn admit(&mut self, chunk: Chunk, checksum: Checksum) -> Result<()> {
        self.stats.chunks += 1;
        let size = chunk.len() as u64;
        match self.index.admit(checksum.clone(), chunk.offset, size) {
            Admission::Repeat(slot) => {
                debug!(offset = chunk.offset, size, slot, "duplicate chunk");
            }
            Admission::New(slot) => {
                debug!(offset = chunk.offset, size, slot, %checksum, "new chunk");
                self.stats.unique_bytes += size;
                while self.compressing.len() >= self.workers {
                    self.finish_compress().await?;
                }
                let algo = self.compression;
                self.compressing.spawn_blocking(move || {
                    let (stored, applied) = compress_or_raw(&chunk.data, algo)?;
                    Ok((slot as u64, (checksum, stored, applied)))
                });
            }
        }
        Ok(())
    }

    async fn finish_compress(&mut self) -> Result<()> {
        let Some(joined) = self.compressing.join_next().await else {
            return Ok(());
        };
        let (slot, compressed) = joined??;
        self.compressed.insert(slot, compressed);
        while let Some((checksum, stored, algo)) = self.compressed.pop_ready() {
            self.cancel.check()?;
            let len = stored.len() as u64;
            let placement = self.store.put(&checksum, Bytes::from(stored)).await?;
            self.stats.stored_bytes += len;
            self.placed.push((placement, algo));
        }
        Ok(())
    }
}

/// Releases items strictly in sequence order, whatever order they arrive in.
#[derive(Debug)]
struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    fn insert(&mut self, seq: u64, item: T) {
        self.pending.insert(seq, item);
    }

    fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
