//! Reconstruction: validate a dictionary, then fetch, decode and scatter-write
//! every unique chunk to each of its source offsets.
//!
//! Seed files are re-chunked with the dictionary's parameters first; any chunk
//! they already hold is written from the seed and never read from the store.

use crate::cancel::CancelToken;
use crate::chunker::Chunker;
use crate::config::{ChunkerConfig, UnpackConfig};
use crate::dictionary::{ChunkDescriptor, ChunkDictionary};
use crate::error::{ArchiveError, Result};
use crate::fingerprint::{to_hex, Blake3Hasher, ChunkHasher, SourceHasher};
use crate::store::ChunkStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

const READ_BLOCK: usize = 1024 * 1024;

/// Random-access target of a reconstruction.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Size the output to the final source length
    async fn set_len(&self, len: u64) -> Result<()>;

    /// Write `data` starting at `offset`
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush buffered writes
    async fn finish(&self) -> Result<()>;

    /// BLAKE3 of the full current content
    async fn checksum(&self) -> Result<Vec<u8>>;
}

/// Output file. Writes are serialized through one handle.
pub struct FileDestination {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDestination {
    /// Create or truncate the output file
    pub async fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Path of the output file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().await.set_len(len).await?;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn checksum(&self) -> Result<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = SourceHasher::new();
        let mut buf = vec![0u8; READ_BLOCK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().0)
    }
}

/// In-memory output buffer.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    buf: std::sync::Mutex<Vec<u8>>,
}

impl MemoryDestination {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current content
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

fn poisoned() -> ArchiveError {
    ArchiveError::Io(std::io::Error::other("destination buffer lock poisoned"))
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn set_len(&self, len: u64) -> Result<()> {
        self.buf.lock().map_err(|_| poisoned())?.resize(len as usize, 0);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock().map_err(|_| poisoned())?;
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    async fn checksum(&self) -> Result<Vec<u8>> {
        let buf = self.buf.lock().map_err(|_| poisoned())?;
        Ok(blake3::hash(&buf).as_bytes().to_vec())
    }
}

/// Statistics from an unpacking run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackStats {
    /// Descriptors restored, from the store or a seed
    pub descriptors: usize,
    /// Descriptors restored from seed files
    pub seeded: usize,
    /// Chunk placements written
    pub placements: usize,
    /// Bytes written to the destination
    pub bytes_written: u64,
}

/// Rebuilds a source from its dictionary and chunk store.
pub struct Unpacker {
    config: UnpackConfig,
    hasher: Arc<dyn ChunkHasher>,
    cancel: CancelToken,
}

impl Unpacker {
    /// Create an unpacker verifying with BLAKE3
    pub fn new(config: UnpackConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(ArchiveError::InvalidParameters(
                "unpack workers must be non-zero".into(),
            ));
        }
        Ok(Self {
            config,
            hasher: Arc::new(Blake3Hasher),
            cancel: CancelToken::new(),
        })
    }

    /// Verify chunks with another strong hash
    pub fn with_hasher(mut self, hasher: Arc<dyn ChunkHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Abort the run when this token is cancelled
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reconstruct the source described by `dictionary` into `dest`.
    ///
    /// Nothing is written unless the dictionary validates. Chunks found in the
    /// configured seed files are written first and skipped when reading the
    /// store. A failing chunk does not stop the others; the first failure in
    /// descriptor order is returned once every started chunk has finished.
    /// Partial output is left in place.
    #[instrument(skip_all, fields(size = dictionary.source_total_size, descriptors = dictionary.chunk_descriptors.len()))]
    pub async fn unpack(
        &self,
        dictionary: &ChunkDictionary,
        store: Arc<dyn ChunkStore>,
        dest: Arc<dyn Destination>,
    ) -> Result<UnpackStats> {
        dictionary.validate()?;
        self.cancel.check()?;
        dest.set_len(dictionary.source_total_size).await?;

        let mut stats = UnpackStats::default();
        let seeded = self.apply_seeds(dictionary, &dest, &mut stats).await?;

        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();
        let mut failures: Vec<(usize, ArchiveError)> = Vec::new();

        for (i, descriptor) in dictionary.chunk_descriptors.iter().enumerate() {
            if self.cancel.is_cancelled() {
                failures.push((i, ArchiveError::Cancelled));
                break;
            }
            if seeded.contains(&i) {
                continue;
            }
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?;
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut stats, &mut failures);
            }
            let restore = Restore {
                descriptor: descriptor.clone(),
                store: store.clone(),
                dest: dest.clone(),
                hasher: self.config.verify_chunks.then(|| self.hasher.clone()),
                cancel: self.cancel.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                (i, restore.run().await)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut stats, &mut failures);
        }

        if let Some((i, err)) = failures.into_iter().min_by_key(|(i, _)| *i) {
            warn!(descriptor = i, error = %err, "unpack incomplete");
            return Err(err);
        }

        dest.finish().await?;
        if self.config.verify_output {
            let actual = dest.checksum().await?;
            if actual != dictionary.source_checksum {
                warn!("reconstructed output does not match source checksum");
                return Err(ArchiveError::Verification {
                    what: "output".into(),
                    expected: to_hex(&dictionary.source_checksum),
                    actual: to_hex(&actual),
                });
            }
        }

        info!(
            descriptors = stats.descriptors,
            seeded = stats.seeded,
            placements = stats.placements,
            bytes = stats.bytes_written,
            "unpack complete"
        );
        Ok(stats)
    }

    /// Write every descriptor the seed files can supply.
    /// Returns the indices of the descriptors now restored.
    async fn apply_seeds(
        &self,
        dictionary: &ChunkDictionary,
        dest: &Arc<dyn Destination>,
        stats: &mut UnpackStats,
    ) -> Result<HashSet<usize>> {
        let mut satisfied = HashSet::new();
        if self.config.seeds.is_empty() {
            return Ok(satisfied);
        }
        let Some(params) = dictionary.chunker_config() else {
            warn!("dictionary records no chunker parameters, ignoring seeds");
            return Ok(satisfied);
        };
        params.validate()?;

        let wanted: Arc<HashMap<Vec<u8>, (usize, u64)>> = Arc::new(
            dictionary
                .chunk_descriptors
                .iter()
                .enumerate()
                .map(|(i, d)| (d.checksum.clone(), (i, d.source_size)))
                .collect(),
        );

        for path in &self.config.seeds {
            if satisfied.len() == dictionary.chunk_descriptors.len() {
                break;
            }
            let (tx, mut rx) = mpsc::channel::<(usize, Bytes)>(self.config.workers);
            let scan = tokio::task::spawn_blocking({
                let path = path.clone();
                let wanted = wanted.clone();
                let hasher = self.hasher.clone();
                let cancel = self.cancel.clone();
                move || scan_seed(&path, &params, hasher.as_ref(), &wanted, &cancel, tx)
            });

            let before = satisfied.len();
            while let Some((i, data)) = rx.recv().await {
                if satisfied.contains(&i) {
                    continue;
                }
                self.cancel.check()?;
                let descriptor = &dictionary.chunk_descriptors[i];
                for &offset in &descriptor.source_offsets {
                    dest.write_at(offset, &data).await?;
                }
                satisfied.insert(i);
                stats.seeded += 1;
                stats.descriptors += 1;
                stats.placements += descriptor.source_offsets.len();
                stats.bytes_written += data.len() as u64 * descriptor.source_offsets.len() as u64;
            }
            let scanned = scan.await??;
            debug!(
                seed = %path.display(),
                scanned,
                matched = satisfied.len() - before,
                "seed scanned"
            );
        }
        Ok(satisfied)
    }
}

/// Chunk one seed file and send every chunk some descriptor wants.
/// Returns the number of bytes scanned.
fn scan_seed(
    path: &Path,
    params: &ChunkerConfig,
    hasher: &dyn ChunkHasher,
    wanted: &HashMap<Vec<u8>, (usize, u64)>,
    cancel: &CancelToken,
    tx: mpsc::Sender<(usize, Bytes)>,
) -> Result<u64> {
    let file = std::fs::File::open(path)?;
    let mut chunker = Chunker::new(params, file)?;
    let mut sent = HashSet::new();
    while let Some(chunk) = chunker.next_chunk()? {
        cancel.check()?;
        let checksum = hasher.checksum(&chunk.data, params.hash_length);
        let Some(&(i, size)) = wanted.get(checksum.as_bytes()) else {
            continue;
        };
        if size != chunk.len() as u64 || !sent.insert(i) {
            continue;
        }
        if tx.blocking_send((i, chunk.data)).is_err() {
            break;
        }
    }
    Ok(chunker.position())
}

fn collect(
    joined: std::result::Result<(usize, Result<(usize, u64)>), tokio::task::JoinError>,
    stats: &mut UnpackStats,
    failures: &mut Vec<(usize, ArchiveError)>,
) {
    match joined {
        Ok((_, Ok((placements, bytes)))) => {
            stats.descriptors += 1;
            stats.placements += placements;
            stats.bytes_written += bytes;
        }
        Ok((i, Err(e))) => {
            warn!(descriptor = i, error = %e, "chunk restore failed");
            failures.push((i, e));
        }
        Err(e) => failures.push((usize::MAX, e.into())),
    }
}

/// One descriptor's worth of work.
struct Restore {
    descriptor: ChunkDescriptor,
    store: Arc<dyn ChunkStore>,
    dest: Arc<dyn Destination>,
    hasher: Option<Arc<dyn ChunkHasher>>,
    cancel: CancelToken,
}

impl Restore {
    async fn run(self) -> Result<(usize, u64)> {
        self.cancel.check()?;
        let data = self.store.fetch(&self.descriptor).await?;
        let data = match self.hasher {
            Some(hasher) => {
                let expected = self.descriptor.checksum.clone();
                tokio::task::spawn_blocking(move || verify_chunk(hasher.as_ref(), data, &expected))
                    .await??
            }
            None => data,
        };

        let mut bytes = 0u64;
        for &offset in &self.descriptor.source_offsets {
            self.cancel.check()?;
            self.dest.write_at(offset, &data).await?;
            bytes += data.len() as u64;
        }
        debug!(
            checksum = %self.descriptor.checksum_hex(),
            placements = self.descriptor.source_offsets.len(),
            "restored chunk"
        );
        Ok((self.descriptor.source_offsets.len(), bytes))
    }
}

fn verify_chunk(hasher: &dyn ChunkHasher, data: Vec<u8>, expected: &[u8]) -> Result<Vec<u8>> {
    let actual = hasher.checksum(&data, expected.len());
    if actual.as_bytes() != expected {
        return Err(ArchiveError::Verification {
            what: "chunk".into(),
            expected: to_hex(expected),
            actual: actual.to_hex(),
        });
    }
    Ok(data)
}
